use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    models::{
        now_millis, ExecuteState, ExecuteTaskParam, Instance, Job, Operation, RouteStrategy, Task,
        Worker,
    },
    timing_wheel::{Timing, TimingWheel},
    traits::{Discovery, TaskRepository, TaskTransport},
    SchedulerError, SchedulerResult,
};

use crate::strategies::WorkerRouter;

/// 任务派发配置
#[derive(Debug, Clone)]
pub struct TaskDispatcherConfig {
    pub retry_max_count: u32,
    pub retry_backoff_ms: u64,
    pub virtual_node_count: usize,
    pub tick_ms: i64,
}

impl Default for TaskDispatcherConfig {
    fn default() -> Self {
        Self {
            retry_max_count: 3,
            retry_backoff_ms: 1_000, // 1秒
            virtual_node_count: 100,
            tick_ms: 1_000, // 时间轮刻度
        }
    }
}

/// 分片任务未能派发而终止，接收方需要汇总实例状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailedEvent {
    pub instance_id: i64,
    pub task_id: i64,
    /// DISPATCH_FAILED或WAITING_CANCELED
    pub execute_state: ExecuteState,
    pub message: String,
}

struct RetryItem {
    group: String,
    param: ExecuteTaskParam,
    time: i64,
}

impl Timing for RetryItem {
    fn timing(&self) -> i64 {
        self.time
    }
}

/// 本进程内嵌Worker的派发通道
pub type LocalTarget = (Worker, Arc<dyn TaskTransport>);

pub struct TaskDispatcher {
    discovery: Arc<dyn Discovery<Worker>>,
    transport: Arc<dyn TaskTransport>,
    local: Option<LocalTarget>,
    task_repo: Arc<dyn TaskRepository>,
    router: WorkerRouter,
    wheel: TimingWheel<RetryItem>,
    config: TaskDispatcherConfig,
    failed_tx: mpsc::UnboundedSender<DispatchFailedEvent>,
}

impl TaskDispatcher {
    pub fn new(
        discovery: Arc<dyn Discovery<Worker>>,
        transport: Arc<dyn TaskTransport>,
        task_repo: Arc<dyn TaskRepository>,
        local: Option<LocalTarget>,
        config: Option<TaskDispatcherConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchFailedEvent>) {
        let config = config.unwrap_or_default();
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let local_worker = local.as_ref().map(|(w, _)| w.clone());
        let dispatcher = Self {
            discovery,
            transport,
            router: WorkerRouter::new(local_worker, config.virtual_node_count),
            local,
            task_repo,
            wheel: TimingWheel::new(config.tick_ms, 60),
            config,
            failed_tx,
        };
        (dispatcher, failed_rx)
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery<Worker>> {
        &self.discovery
    }

    /// 派发实例下的分片任务
    ///
    /// 分组内没有存活Worker时返回`NoAvailableWorker`，由调用方决定是否重新调度。
    /// 返回false表示部分任务发送失败，已进入重试队列。
    pub async fn dispatch(
        &self,
        job: &Job,
        instance: &Instance,
        tasks: &[Task],
    ) -> SchedulerResult<bool> {
        let params = tasks
            .iter()
            .map(|t| ExecuteTaskParam::from_task(Operation::Trigger, job, instance, t))
            .collect();
        self.dispatch_params(&job.group, params).await
    }

    /// 向分片任务所在Worker发送暂停/取消指令
    pub async fn dispatch_operation(
        &self,
        operation: Operation,
        job: &Job,
        instance: &Instance,
        tasks: &[Task],
    ) -> SchedulerResult<bool> {
        let params: Vec<ExecuteTaskParam> = tasks
            .iter()
            .filter(|t| t.worker.is_some())
            .map(|t| ExecuteTaskParam::from_task(operation, job, instance, t))
            .collect();
        if params.is_empty() {
            return Ok(true);
        }
        self.dispatch_params(&job.group, params).await
    }

    async fn dispatch_params(
        &self,
        group: &str,
        params: Vec<ExecuteTaskParam>,
    ) -> SchedulerResult<bool> {
        let workers = self.discovery.discovered_servers(Some(group));
        if workers.is_empty() {
            return Err(SchedulerError::NoAvailableWorker {
                group: group.to_string(),
            });
        }

        // 未到触发时间的任务先放入时间轮
        let now = now_millis();
        let (due, delayed): (Vec<_>, Vec<_>) = params
            .into_iter()
            .partition(|p| !p.operation.is_trigger() || p.trigger_time <= now);
        for param in delayed {
            debug!(
                "任务未到触发时间，延迟派发: task_id={}, trigger_time={}",
                param.task_id, param.trigger_time
            );
            let time = param.trigger_time;
            self.wheel.offer(
                RetryItem {
                    group: group.to_string(),
                    param,
                    time,
                },
                now,
            );
        }

        let mut assigned = Vec::with_capacity(due.len());
        for param in due {
            if let Some(param) = self.assign(group, param, &workers).await? {
                assigned.push(param);
            }
        }

        let mut all_sent = true;
        for (worker, batch) in group_by_worker(assigned) {
            counter!("scheduler_dispatch_total").increment(batch.len() as u64);
            if let Err(e) = self.send(&worker, &batch).await {
                warn!("派发任务到 {} 失败: {}", worker, e);
                counter!("scheduler_dispatch_failed_total").increment(batch.len() as u64);
                all_sent = false;
                for param in batch {
                    self.retry_later(group, param, now);
                }
            }
        }
        Ok(all_sent)
    }

    /// 确定目标Worker，返回None表示该任务无需发送
    async fn assign(
        &self,
        group: &str,
        mut param: ExecuteTaskParam,
        workers: &[Worker],
    ) -> SchedulerResult<Option<ExecuteTaskParam>> {
        let is_trigger = param.operation.is_trigger();
        if is_trigger && param.route_strategy != RouteStrategy::Broadcast {
            let worker = self
                .router
                .route(param.route_strategy, group, param.task_id, workers)?;
            if param.worker.as_ref() != Some(&worker)
                && self
                    .task_repo
                    .update_worker(&[param.task_id], Some(&worker))
                    .await?
                    == 0
            {
                debug!("任务已不处于等待状态，跳过派发: {}", param.task_id);
                return Ok(None);
            }
            param.worker = Some(worker);
            return Ok(Some(param));
        }

        let alive = param.worker.as_ref().is_some_and(|w| workers.contains(w));
        if alive {
            return Ok(Some(param));
        }
        if !is_trigger {
            debug!(
                "任务所在Worker已下线，忽略{}指令: {}",
                param.operation, param.task_id
            );
            return Ok(None);
        }

        // 广播任务指定的Worker已下线
        let message = format!(
            "广播任务的Worker已下线: {}",
            param
                .worker
                .as_ref()
                .map(|w| w.to_string())
                .unwrap_or_default()
        );
        let canceled = self
            .task_repo
            .terminate(
                param.task_id,
                None,
                ExecuteState::WaitingCanceled,
                ExecuteState::Waiting,
                Some(now_millis()),
                Some(message.clone()),
            )
            .await?;
        if canceled {
            info!("广播任务Worker已下线，取消任务: {}", param.task_id);
            self.notify_failed(DispatchFailedEvent {
                instance_id: param.instance_id,
                task_id: param.task_id,
                execute_state: ExecuteState::WaitingCanceled,
                message,
            });
        }
        Ok(None)
    }

    async fn send(&self, worker: &Worker, batch: &[ExecuteTaskParam]) -> SchedulerResult<()> {
        if let Some((local, transport)) = &self.local {
            if local == worker {
                return transport.dispatch(worker, batch).await;
            }
        }
        self.transport.dispatch(worker, batch).await
    }

    fn retry_later(&self, group: &str, mut param: ExecuteTaskParam, now: i64) {
        param.dispatch_attempt += 1;
        let attempt = param.dispatch_attempt;
        if attempt > self.config.retry_max_count {
            self.give_up(param);
            return;
        }
        let delay = self.config.retry_backoff_ms as i64 * i64::from(attempt * attempt);
        self.wheel.offer(
            RetryItem {
                group: group.to_string(),
                param,
                time: now + delay,
            },
            now,
        );
    }

    fn give_up(&self, param: ExecuteTaskParam) {
        if !param.operation.is_trigger() {
            warn!(
                "{}指令派发重试耗尽，放弃: task_id={}",
                param.operation, param.task_id
            );
            return;
        }
        error!("任务派发重试耗尽: task_id={}", param.task_id);
        self.notify_failed(DispatchFailedEvent {
            instance_id: param.instance_id,
            task_id: param.task_id,
            execute_state: ExecuteState::DispatchFailed,
            message: format!("派发重试{}次后失败", self.config.retry_max_count),
        });
    }

    fn notify_failed(&self, event: DispatchFailedEvent) {
        let task_id = event.task_id;
        if self.failed_tx.send(event).is_err() {
            warn!("派发失败事件无人接收: task_id={}", task_id);
        }
    }

    /// 处理到期的重试，返回处理数量
    pub async fn process_retries(&self, now: i64) -> usize {
        let items = self.wheel.poll(now);
        let count = items.len();
        for item in items {
            self.redispatch(item, now).await;
        }
        count
    }

    async fn redispatch(&self, item: RetryItem, now: i64) {
        let RetryItem { group, param, .. } = item;
        if param.operation.is_trigger() {
            match self.task_repo.get(param.task_id).await {
                Ok(Some(task)) if task.execute_state == ExecuteState::Waiting => {}
                Ok(_) => {
                    debug!("任务已不处于等待状态，取消重试: {}", param.task_id);
                    return;
                }
                Err(e) => {
                    warn!("重试派发查询任务失败 {}: {}", param.task_id, e);
                    self.retry_later(&group, param, now);
                    return;
                }
            }
        }

        let workers = self.discovery.discovered_servers(Some(&group));
        if workers.is_empty() {
            self.retry_later(&group, param, now);
            return;
        }
        let param = match self.assign(&group, param.clone(), &workers).await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                warn!("重试派发路由失败 {}: {}", param.task_id, e);
                self.retry_later(&group, param, now);
                return;
            }
        };
        let Some(worker) = param.worker.clone() else {
            return;
        };
        counter!("scheduler_dispatch_total").increment(1);
        if let Err(e) = self.send(&worker, std::slice::from_ref(&param)).await {
            warn!(
                "第{}次重试派发失败 {}: {}",
                param.dispatch_attempt, param.task_id, e
            );
            counter!("scheduler_dispatch_failed_total").increment(1);
            self.retry_later(&group, param, now);
        } else {
            info!("重试派发成功: task_id={}, worker={}", param.task_id, worker);
        }
    }

    pub fn pending_retries(&self) -> usize {
        self.wheel.len()
    }

    /// 启动重试轮询
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let token = parent.child_token();
        let tick = Duration::from_millis(self.config.tick_ms.max(1) as u64);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        dispatcher.process_retries(now_millis()).await;
                    }
                }
            }
            debug!("派发重试轮询已停止");
        })
    }
}

fn group_by_worker(params: Vec<ExecuteTaskParam>) -> Vec<(Worker, Vec<ExecuteTaskParam>)> {
    let mut grouped: HashMap<Worker, Vec<ExecuteTaskParam>> = HashMap::new();
    let mut order = Vec::new();
    for param in params {
        let Some(worker) = param.worker.clone() else {
            continue;
        };
        if !grouped.contains_key(&worker) {
            order.push(worker.clone());
        }
        grouped.entry(worker).or_default().push(param);
    }
    order
        .into_iter()
        .filter_map(|w| grouped.remove(&w).map(|batch| (w, batch)))
        .collect()
}
