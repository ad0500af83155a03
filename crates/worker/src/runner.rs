use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    models::{
        now_millis, truncate_text, ExecuteState, ExecuteTaskParam, Operation, StartTaskParam,
        StopTaskParam, Worker, MAX_ERROR_MSG_LENGTH,
    },
    traits::{ExecuteResult, ExecutionContext, JobHandler, SupervisorRpc},
    SchedulerResult,
};

use crate::handler_registry::HandlerRegistry;

/// 执行中任务被中断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Supervisor下发的暂停或取消
    Operation(Operation),
    /// 线程池关闭，任务退回等待状态
    Shutdown,
}

impl StopReason {
    fn report(self) -> (Operation, ExecuteState) {
        match self {
            StopReason::Operation(op) => (op, op.to_state()),
            StopReason::Shutdown => (Operation::Pause, ExecuteState::Waiting),
        }
    }
}

/// 活动任务的中断信号，由线程池与执行线程共享
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只记录第一次中断的原因
    pub fn stop(&self, reason: StopReason) {
        if let Ok(mut current) = self.reason.lock() {
            current.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

enum Outcome {
    Completed(SchedulerResult<ExecuteResult>),
    Panicked(String),
    TimedOut,
    Stopped,
}

/// 执行单个分片任务的完整生命周期并上报结果
pub struct TaskRunner {
    worker: Worker,
    handlers: Arc<HandlerRegistry>,
    supervisor: Arc<dyn SupervisorRpc>,
}

impl TaskRunner {
    pub fn new(
        worker: Worker,
        handlers: Arc<HandlerRegistry>,
        supervisor: Arc<dyn SupervisorRpc>,
    ) -> Self {
        Self {
            worker,
            handlers,
            supervisor,
        }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn supervisor(&self) -> &Arc<dyn SupervisorRpc> {
        &self.supervisor
    }

    pub async fn run(&self, param: &ExecuteTaskParam, signal: &StopSignal) {
        let start = StartTaskParam {
            job_id: param.job_id,
            instance_id: param.instance_id,
            task_id: param.task_id,
            worker: self.worker.clone(),
            start_time: now_millis(),
        };
        let task = match self.supervisor.start_task(&start).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("任务 {} 已被其它Worker执行或实例不可用", param.task_id);
                return;
            }
            Err(e) => {
                error!("开始任务 {} 失败: {}", param.task_id, e);
                return;
            }
        };

        let Some(handler) = self.handlers.get(&param.job_handler) else {
            warn!("找不到任务处理器: {}", param.job_handler);
            self.report(
                param,
                Operation::Trigger,
                ExecuteState::InstanceFailed,
                Some(format!("找不到任务处理器: {}", param.job_handler)),
            )
            .await;
            return;
        };

        let ctx = ExecutionContext::new(
            param.job_id,
            param.instance_id,
            param.task_id,
            task.shard_index,
            task.shard_count,
            param.trigger_time,
            task.task_param,
            task.execute_snapshot,
            signal.token().clone(),
            self.worker.clone(),
            self.supervisor.clone(),
        );

        let (to_state, error_msg) = self.execute_lifecycle(param, handler, &ctx).await;
        let (operation, to_state) = match signal.reason() {
            // 中断优先于执行结果
            Some(reason) if to_state != ExecuteState::Finished => reason.report(),
            _ => (Operation::Trigger, to_state),
        };
        self.report(param, operation, to_state, error_msg).await;
    }

    async fn execute_lifecycle(
        &self,
        param: &ExecuteTaskParam,
        handler: Arc<dyn JobHandler>,
        ctx: &ExecutionContext,
    ) -> (ExecuteState, Option<String>) {
        match handler.verify_task(ctx).await {
            Ok(true) => {}
            Ok(false) => return (ExecuteState::VerifyFailed, Some("任务校验未通过".to_string())),
            Err(e) => return (ExecuteState::VerifyFailed, Some(e.to_string())),
        }
        if let Err(e) = handler.init(ctx).await {
            handler.destroy(ctx).await;
            return (ExecuteState::InitException, Some(e.to_string()));
        }

        let outcome = self.execute_guarded(param, handler.clone(), ctx).await;
        handler.destroy(ctx).await;

        match outcome {
            Outcome::Completed(Ok(result)) if result.success => {
                info!("任务执行成功: task_id={}", param.task_id);
                (ExecuteState::Finished, None)
            }
            Outcome::Completed(Ok(result)) => (
                ExecuteState::ExecuteFailed,
                Some(result.message.unwrap_or_else(|| "执行失败".to_string())),
            ),
            Outcome::Completed(Err(e)) => (ExecuteState::ExecuteException, Some(e.to_string())),
            Outcome::Panicked(msg) => (ExecuteState::ExecuteException, Some(msg)),
            Outcome::TimedOut => {
                warn!(
                    "任务执行超时: task_id={}, timeout={}ms",
                    param.task_id, param.execute_timeout_ms
                );
                (
                    ExecuteState::ExecuteTimeout,
                    Some(format!("执行超过{}毫秒", param.execute_timeout_ms)),
                )
            }
            Outcome::Stopped => (ExecuteState::ExecuteAborted, Some("任务被中断".to_string())),
        }
    }

    /// 处理器在独立任务中运行，超时或中断时不等待它自行退出
    async fn execute_guarded(
        &self,
        param: &ExecuteTaskParam,
        handler: Arc<dyn JobHandler>,
        ctx: &ExecutionContext,
    ) -> Outcome {
        let exec_ctx = ctx.clone();
        let mut execution = tokio::spawn(async move { handler.execute(&exec_ctx).await });
        let timeout = (param.execute_timeout_ms > 0)
            .then(|| Duration::from_millis(param.execute_timeout_ms as u64));

        let outcome = tokio::select! {
            joined = &mut execution => match joined {
                Ok(result) => Outcome::Completed(result),
                Err(e) => Outcome::Panicked(format!("处理器异常退出: {e}")),
            },
            _ = ctx.cancel_token().cancelled() => Outcome::Stopped,
            _ = expire(timeout) => Outcome::TimedOut,
        };
        if matches!(outcome, Outcome::Stopped | Outcome::TimedOut) {
            ctx.cancel_token().cancel();
            execution.abort();
        }
        outcome
    }

    async fn report(
        &self,
        param: &ExecuteTaskParam,
        operation: Operation,
        to_state: ExecuteState,
        error_msg: Option<String>,
    ) {
        counter!("worker_task_executed_total", "state" => to_state.to_string()).increment(1);
        let stop = StopTaskParam {
            instance_id: param.instance_id,
            task_id: param.task_id,
            worker: self.worker.clone(),
            operation,
            to_state,
            error_msg: error_msg.map(|m| truncate_text(&m, MAX_ERROR_MSG_LENGTH)),
        };
        match self.supervisor.stop_task(&stop).await {
            Ok(true) => debug!("上报任务 {} 状态: {}", param.task_id, to_state),
            Ok(false) => warn!("上报任务 {} 状态冲突: {}", param.task_id, to_state),
            Err(e) => error!("上报任务 {} 状态失败 {}: {}", param.task_id, to_state, e),
        }
    }

    /// 任务不在本Worker执行时直接上报中断结果
    pub async fn report_stopped(&self, param: &ExecuteTaskParam) {
        self.report(param, param.operation, param.operation.to_state(), None)
            .await;
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{execute_param, RecordingSupervisor, SleepHandler};
    use async_trait::async_trait;
    use scheduler_core::SchedulerError;

    struct ScriptedHandler {
        verified: bool,
        init_fails: bool,
        result: fn() -> SchedulerResult<ExecuteResult>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn verify_task(&self, _ctx: &ExecutionContext) -> SchedulerResult<bool> {
            Ok(self.verified)
        }

        async fn init(&self, _ctx: &ExecutionContext) -> SchedulerResult<()> {
            if self.init_fails {
                return Err(SchedulerError::TaskExecution("init".to_string()));
            }
            Ok(())
        }

        async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult> {
            ctx.savepoint("checkpoint-1").await?;
            (self.result)()
        }
    }

    fn scripted(verified: bool, init_fails: bool, result: fn() -> SchedulerResult<ExecuteResult>) -> Arc<dyn JobHandler> {
        Arc::new(ScriptedHandler {
            verified,
            init_fails,
            result,
        })
    }

    fn runner(supervisor: Arc<RecordingSupervisor>, handler: Arc<dyn JobHandler>) -> TaskRunner {
        let mut handlers = HandlerRegistry::new();
        handlers.register("job", handler);
        TaskRunner::new(
            Worker::new("app", "w1", "127.0.0.1", 9001),
            Arc::new(handlers),
            supervisor,
        )
    }

    async fn run_once(handler: Arc<dyn JobHandler>) -> (ExecuteState, Arc<RecordingSupervisor>) {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let runner = runner(supervisor.clone(), handler);
        runner.run(&execute_param(1, "job"), &StopSignal::new()).await;
        let state = supervisor.stopped()[0].to_state;
        (state, supervisor)
    }

    #[tokio::test]
    async fn test_lifecycle_reports_terminal_state() {
        let (state, supervisor) = run_once(scripted(true, false, || Ok(ExecuteResult::success()))).await;
        assert_eq!(state, ExecuteState::Finished);
        assert_eq!(supervisor.snapshots()[0].snapshot, "checkpoint-1");

        let (state, supervisor) =
            run_once(scripted(true, false, || Ok(ExecuteResult::failure("bad input")))).await;
        assert_eq!(state, ExecuteState::ExecuteFailed);
        assert_eq!(supervisor.stopped()[0].error_msg.as_deref(), Some("bad input"));

        let (state, _) = run_once(scripted(true, false, || {
            Err(SchedulerError::TaskExecution("boom".to_string()))
        }))
        .await;
        assert_eq!(state, ExecuteState::ExecuteException);

        let (state, _) = run_once(scripted(false, false, || Ok(ExecuteResult::success()))).await;
        assert_eq!(state, ExecuteState::VerifyFailed);

        let (state, _) = run_once(scripted(true, true, || Ok(ExecuteResult::success()))).await;
        assert_eq!(state, ExecuteState::InitException);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let runner = runner(
            supervisor.clone(),
            Arc::new(SleepHandler::new(Duration::from_secs(30))),
        );
        let mut param = execute_param(2, "job");
        param.execute_timeout_ms = 50;
        runner.run(&param, &StopSignal::new()).await;

        let stopped = supervisor.stopped();
        assert_eq!(stopped[0].to_state, ExecuteState::ExecuteTimeout);
        assert_eq!(stopped[0].operation, Operation::Trigger);
    }

    #[tokio::test]
    async fn test_pause_signal_reports_paused() {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let runner = Arc::new(runner(
            supervisor.clone(),
            Arc::new(SleepHandler::new(Duration::from_secs(30))),
        ));
        let signal = StopSignal::new();
        let handle = {
            let runner = runner.clone();
            let signal = signal.clone();
            tokio::spawn(async move { runner.run(&execute_param(3, "job"), &signal).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.stop(StopReason::Operation(Operation::Pause));
        signal.stop(StopReason::Shutdown);
        handle.await.unwrap();

        let stopped = supervisor.stopped();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].operation, Operation::Pause);
        assert_eq!(stopped[0].to_state, ExecuteState::Paused);
    }
}
