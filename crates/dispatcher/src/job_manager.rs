use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    id_generator::IdGenerator,
    models::{
        now_millis, obtain_run_state, truncate_text, ExecuteState, Instance, Job, JobHandlerParam,
        JobState, Operation, RetryType, RunState, RunType, SavepointParam, StartTaskParam,
        StopTaskParam, Task, TriggerType, Worker, AWAITING_COMPLETION, MAX_ERROR_MSG_LENGTH,
        MAX_SNAPSHOT_LENGTH,
    },
    traits::{
        Discovery, InstanceRepository, JobRepository, TaskRepository, TriggeredInstance, WorkerRpc,
    },
    SchedulerError, SchedulerResult,
};

use crate::task_dispatcher::{DispatchFailedEvent, TaskDispatcher};
use crate::trigger::TriggerCalculator;

/// 实例锁的分段数
const LOCK_STRIPES: usize = 64;

/// 任务管理配置
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub maximum_split_task_size: usize,
    pub maximum_retry_count: u32,
    /// Worker关闭时退回的任务，延迟多久交给恢复扫描
    pub shutdown_task_delay_resume_ms: i64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            maximum_split_task_size: 1_000,
            maximum_retry_count: 10,
            shutdown_task_delay_resume_ms: 30_000, // 30秒
        }
    }
}

/// 释放实例锁之后再执行的派发
struct DispatchAction {
    operation: Operation,
    job: Job,
    instance: Instance,
    tasks: Vec<Task>,
}

/// 实例锁内产生、释放锁之后才执行的后续动作
enum FollowUp {
    Dispatch(DispatchAction),
    /// 实例已结束：重试、触发下游和FIXED_DELAY更新可能调用Worker拆分，不能持锁执行
    Terminated { instance: Instance, follow_up: bool },
}

/// Supervisor端的实例生命周期管理
///
/// 同一实例上的状态变更通过分段锁串行化，锁内只做存储层的比较并交换，
/// 派发、重试和触发下游等需要远程调用的动作在释放锁之后执行。
pub struct JobManager {
    job_repo: Arc<dyn JobRepository>,
    instance_repo: Arc<dyn InstanceRepository>,
    task_repo: Arc<dyn TaskRepository>,
    id_generator: Arc<dyn IdGenerator>,
    dispatcher: Arc<TaskDispatcher>,
    worker_rpc: Arc<dyn WorkerRpc>,
    locks: Vec<Mutex<()>>,
    config: JobManagerConfig,
}

impl JobManager {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        instance_repo: Arc<dyn InstanceRepository>,
        task_repo: Arc<dyn TaskRepository>,
        id_generator: Arc<dyn IdGenerator>,
        dispatcher: Arc<TaskDispatcher>,
        worker_rpc: Arc<dyn WorkerRpc>,
        config: Option<JobManagerConfig>,
    ) -> Self {
        Self {
            job_repo,
            instance_repo,
            task_repo,
            id_generator,
            dispatcher,
            worker_rpc,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            config: config.unwrap_or_default(),
        }
    }

    pub fn job_repo(&self) -> &Arc<dyn JobRepository> {
        &self.job_repo
    }

    pub fn instance_repo(&self) -> &Arc<dyn InstanceRepository> {
        &self.instance_repo
    }

    pub fn task_repo(&self) -> &Arc<dyn TaskRepository> {
        &self.task_repo
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery<Worker>> {
        self.dispatcher.discovery()
    }

    pub fn has_discovered_workers(&self) -> bool {
        self.discovery().has_discovered_servers()
    }

    pub fn has_discovered_group(&self, group: &str) -> bool {
        self.discovery().has_discovered_group(group)
    }

    pub fn is_alive_worker(&self, worker: Option<&Worker>) -> bool {
        worker.is_some_and(|w| self.discovery().is_discovered_server(w))
    }

    /// 是否存在仍在存活Worker上执行的任务
    pub fn has_alive_executing(&self, tasks: &[Task]) -> bool {
        tasks.iter().any(|t| {
            t.execute_state == ExecuteState::Executing && self.is_alive_worker(t.worker.as_ref())
        })
    }

    fn instance_lock(&self, instance_id: i64) -> &Mutex<()> {
        &self.locks[instance_id.rem_euclid(LOCK_STRIPES as i64) as usize]
    }

    fn generate_id(&self) -> SchedulerResult<i64> {
        self.id_generator.generate_id()
    }

    // ----------------------------------------------------------------- job

    /// 新增任务
    ///
    /// 校验触发配置与处理器，计算首次触发时间；已过期或永远不会触发的配置直接拒绝。
    pub async fn add_job(&self, mut job: Job) -> SchedulerResult<i64> {
        job.verify()?;
        if job.retry_count > self.config.maximum_retry_count {
            return Err(SchedulerError::InvalidJobParam(format!(
                "重试次数不能超过{}",
                self.config.maximum_retry_count
            )));
        }
        if !job.trigger_type.validate(&job.trigger_value) {
            return Err(SchedulerError::InvalidTrigger {
                trigger_type: job.trigger_type,
                value: job.trigger_value.clone(),
                message: "格式错误".to_string(),
            });
        }

        if !self.worker_rpc.verify(&JobHandlerParam::from(&job)).await? {
            return Err(SchedulerError::InvalidJobParam(format!(
                "处理器校验未通过: {}",
                job.job_handler
            )));
        }

        job.job_id = self.generate_id()?;
        job.version = 0;
        job.last_trigger_time = None;
        job.next_scan_time = 0;
        job.scan_failed_count = 0;
        job.next_trigger_time = self.initial_trigger_time(&job, now_millis()).await?;

        let job_id = self.job_repo.insert(job).await?;
        info!("新增任务: {}", job_id);
        Ok(job_id)
    }

    async fn initial_trigger_time(&self, job: &Job, now: i64) -> SchedulerResult<Option<i64>> {
        if job.trigger_type == TriggerType::Depend {
            for parent_id in job.parent_job_ids()? {
                if parent_id == job.job_id {
                    return Err(SchedulerError::InvalidJobParam(
                        "任务不能依赖自身".to_string(),
                    ));
                }
                let parent = self
                    .job_repo
                    .get(parent_id)
                    .await?
                    .ok_or(SchedulerError::JobNotFound { id: parent_id })?;
                if parent.group != job.group {
                    return Err(SchedulerError::InvalidJobParam(format!(
                        "依赖的父任务分组不一致: {} != {}",
                        parent.group, job.group
                    )));
                }
            }
            return Ok(None);
        }

        let base = job.start_time.map_or(now, |s| s.max(now));
        let next = match job.trigger_type {
            TriggerType::FixedRate | TriggerType::FixedDelay => Some(base),
            other => other.next_fire_time(&job.trigger_value, base)?,
        };
        let Some(next) = next else {
            return Err(SchedulerError::InvalidJobParam(format!(
                "{}配置不会再触发: {}",
                job.trigger_type, job.trigger_value
            )));
        };
        if job.end_time.is_some_and(|end| next > end) {
            return Err(SchedulerError::InvalidJobParam(format!(
                "{}配置已过期: {}",
                job.trigger_type, job.trigger_value
            )));
        }
        Ok(Some(next))
    }

    /// 启用或禁用任务，启用时重新计算下次触发时间
    pub async fn change_job_state(&self, job_id: i64, state: JobState) -> SchedulerResult<bool> {
        let mut job = self
            .job_repo
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;
        if job.job_state == state {
            return Ok(false);
        }
        if state == JobState::Disable {
            return self.job_repo.update_state(job_id, state, None).await;
        }

        let now = now_millis();
        job.job_state = JobState::Enable;
        job.remark = None;
        job.next_trigger_time = match job.trigger_type {
            TriggerType::Depend => None,
            TriggerType::FixedRate | TriggerType::FixedDelay => {
                let anchor = match job.last_trigger_time {
                    Some(last) => job.trigger_type.next_fire_time(&job.trigger_value, last)?,
                    None => None,
                };
                let next = [Some(now), job.start_time, anchor]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or(now);
                Some(next)
            }
            _ => {
                let next = crate::trigger::compute_next_trigger_time(&job, now)?;
                if next.is_none() {
                    return Err(SchedulerError::InvalidJobParam(format!(
                        "任务没有下次触发时间: {job_id}"
                    )));
                }
                next
            }
        };
        self.job_repo.update_trigger_time(&job).await
    }

    /// 禁用任务并记录原因
    pub async fn disable_job(&self, job: &Job, remark: &str) -> SchedulerResult<bool> {
        warn!("禁用任务 {}: {}", job.job_id, remark);
        self.job_repo
            .update_state(job.job_id, JobState::Disable, Some(truncate_text(remark, 255)))
            .await
    }

    // ----------------------------------------------------------------- instance creation

    /// 拆分分片任务
    ///
    /// 广播任务为每个存活Worker生成一个分片并预先指定Worker，其余通过Worker端的处理器拆分。
    pub async fn split_tasks(
        &self,
        job: &Job,
        instance_id: i64,
        now: i64,
    ) -> SchedulerResult<Vec<Task>> {
        if job.route_strategy.is_broadcast() {
            let workers = self.discovery().discovered_servers(Some(&job.group));
            if workers.is_empty() {
                return Err(SchedulerError::NoAvailableWorker {
                    group: job.group.clone(),
                });
            }
            let count = workers.len() as u32;
            let mut tasks = Vec::with_capacity(workers.len());
            for (index, worker) in workers.iter().enumerate() {
                tasks.push(Task::create(
                    self.generate_id()?,
                    instance_id,
                    index as u32,
                    count,
                    job.job_param.clone(),
                    Some(worker.clone()),
                    now,
                ));
            }
            return Ok(tasks);
        }

        let params = self.worker_rpc.split(&JobHandlerParam::from(job)).await?;
        if params.is_empty() {
            return Err(SchedulerError::InvalidJobParam(format!(
                "处理器未拆分出任何任务: {}",
                job.job_handler
            )));
        }
        if params.len() > self.config.maximum_split_task_size {
            return Err(SchedulerError::InvalidJobParam(format!(
                "拆分的任务数不能超过{}: {}",
                self.config.maximum_split_task_size,
                params.len()
            )));
        }
        let count = params.len() as u32;
        let mut tasks = Vec::with_capacity(params.len());
        for (index, param) in params.into_iter().enumerate() {
            tasks.push(Task::create(
                self.generate_id()?,
                instance_id,
                index as u32,
                count,
                param,
                None,
                now,
            ));
        }
        Ok(tasks)
    }

    /// 构造一次触发的实例与分片任务，不落库
    pub async fn create_triggered(
        &self,
        job: &Job,
        run_type: RunType,
        trigger_time: i64,
        now: i64,
    ) -> SchedulerResult<TriggeredInstance> {
        let instance_id = self.generate_id()?;
        let tasks = self.split_tasks(job, instance_id, now).await?;
        let instance = Instance::create(instance_id, job.job_id, run_type, trigger_time, 0, now);
        Ok(TriggeredInstance { instance, tasks })
    }

    /// 手动触发一次，返回实例ID
    pub async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        let job = self
            .job_repo
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })?;
        let now = now_millis();
        let triggered = self.create_triggered(&job, RunType::Manual, now, now).await?;
        self.instance_repo.insert(&triggered).await?;
        counter!("scheduler_instance_triggered_total", "run_type" => RunType::Manual.name())
            .increment(1);
        info!(
            "手动触发任务 {}: instance_id={}",
            job_id, triggered.instance.instance_id
        );
        let instance_id = triggered.instance.instance_id;
        self.dispatch(&job, &triggered.instance, &triggered.tasks)
            .await;
        Ok(instance_id)
    }

    /// 派发实例的分片任务
    ///
    /// 派发失败不向上抛出：未派发的任务仍是WAITING，由等待实例扫描重新派发。
    pub async fn dispatch(&self, job: &Job, instance: &Instance, tasks: &[Task]) -> bool {
        match self.dispatcher.dispatch(job, instance, tasks).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(
                    "派发实例 {} 失败，等待恢复扫描处理: {}",
                    instance.instance_id, e
                );
                false
            }
        }
    }

    /// 执行锁内收集的后续动作，调用时不能持有实例锁
    async fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Dispatch(action) => self.run_actions(vec![action]).await,
                FollowUp::Terminated {
                    instance,
                    follow_up,
                } => match self.after_terminate(&instance, follow_up).await {
                    Ok(actions) => self.run_actions(actions).await,
                    Err(e) => error!("实例 {} 结束后的处理失败: {}", instance.instance_id, e),
                },
            }
        }
    }

    async fn run_actions(&self, actions: Vec<DispatchAction>) {
        for action in actions {
            let result = if action.operation.is_trigger() {
                self.dispatcher
                    .dispatch(&action.job, &action.instance, &action.tasks)
                    .await
            } else {
                self.dispatcher
                    .dispatch_operation(action.operation, &action.job, &action.instance, &action.tasks)
                    .await
            };
            if let Err(e) = result {
                warn!(
                    "派发{}指令失败 instance_id={}: {}",
                    action.operation, action.instance.instance_id, e
                );
            }
        }
    }

    // ----------------------------------------------------------------- worker reports

    /// Worker开始执行分片任务，抢占成功时返回最新的任务数据
    pub async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        let _guard = self.instance_lock(param.instance_id).lock().await;
        debug!("任务 {} 开始执行: {}", param.task_id, param.worker);
        let now = now_millis();
        self.instance_repo.start(param.instance_id, now).await?;
        let Some(instance) = self.instance_repo.get(param.instance_id).await? else {
            warn!("开始执行的任务实例不存在: {}", param.instance_id);
            return Ok(None);
        };
        if instance.run_state != RunState::Running {
            debug!(
                "实例 {} 处于{}状态，不能开始执行",
                instance.instance_id, instance.run_state
            );
            return Ok(None);
        }
        if !self.task_repo.start(param.task_id, &param.worker, now).await? {
            debug!("任务 {} 抢占执行失败", param.task_id);
            return Ok(None);
        }
        self.task_repo.get(param.task_id).await
    }

    /// Worker上报任务结束、暂停或取消
    pub async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        let to_state = param.to_state;
        if to_state == ExecuteState::Executing {
            return Err(SchedulerError::IllegalTransition {
                from: ExecuteState::Executing,
                to: to_state,
            });
        }
        counter!("scheduler_task_stopped_total", "state" => to_state.to_string()).increment(1);

        let actions = {
            let _guard = self.instance_lock(param.instance_id).lock().await;
            let instance = self
                .instance_repo
                .get(param.instance_id)
                .await?
                .ok_or(SchedulerError::InstanceNotFound {
                    id: param.instance_id,
                })?;
            if instance.is_terminal() {
                return Ok(false);
            }

            let now = now_millis();
            let end_time = to_state.is_terminal().then_some(now);
            let error_msg = param
                .error_msg
                .as_deref()
                .map(|m| truncate_text(m, MAX_ERROR_MSG_LENGTH));
            let stopped = self
                .task_repo
                .terminate(
                    param.task_id,
                    Some(&param.worker),
                    to_state,
                    ExecuteState::Executing,
                    end_time,
                    error_msg,
                )
                .await?;
            if !stopped {
                warn!("结束任务冲突 {}: {}", param.task_id, to_state);
                return Ok(false);
            }

            if to_state == ExecuteState::Waiting {
                // Worker关闭时退回的任务
                let next = now + self.config.shutdown_task_delay_resume_ms;
                self.instance_repo
                    .update_next_scan_time(instance.instance_id, instance.version, next)
                    .await?;
                return Ok(true);
            }
            self.settle(instance, param.operation.is_trigger()).await?
        };
        self.run_follow_ups(actions).await;
        Ok(true)
    }

    pub async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool> {
        if param.snapshot.chars().count() > MAX_SNAPSHOT_LENGTH {
            return Err(SchedulerError::InvalidJobParam(format!(
                "快照长度不能超过{MAX_SNAPSHOT_LENGTH}"
            )));
        }
        self.task_repo
            .savepoint(param.task_id, &param.worker, &param.snapshot)
            .await
    }

    /// 根据分片任务汇总实例状态，实例结束时处理后续动作
    async fn settle(
        &self,
        mut instance: Instance,
        follow_up: bool,
    ) -> SchedulerResult<Vec<FollowUp>> {
        let tasks = self.task_repo.find_by_instance(instance.instance_id).await?;
        let states: Vec<ExecuteState> = tasks.iter().map(|t| t.execute_state).collect();
        match obtain_run_state(&states) {
            None => Ok(Vec::new()),
            Some(RunState::Paused) => {
                self.instance_repo
                    .update_state(instance.instance_id, RunState::Paused, &RunState::PAUSABLE)
                    .await?;
                Ok(Vec::new())
            }
            Some(run_state) => {
                let end_time = latest_end_time(&tasks).unwrap_or_else(now_millis);
                let terminated = self
                    .instance_repo
                    .terminate(
                        instance.instance_id,
                        run_state,
                        &RunState::TERMINABLE,
                        end_time,
                    )
                    .await?;
                if !terminated {
                    return Ok(Vec::new());
                }
                instance.mark_terminated(run_state, end_time);
                Ok(vec![FollowUp::Terminated {
                    instance,
                    follow_up,
                }])
            }
        }
    }

    /// 派发失败的任务：终止后汇总实例
    pub async fn process_dispatch_failed(&self, event: DispatchFailedEvent) -> SchedulerResult<()> {
        let actions = {
            let _guard = self.instance_lock(event.instance_id).lock().await;
            if event.execute_state == ExecuteState::DispatchFailed {
                let terminated = self
                    .task_repo
                    .terminate(
                        event.task_id,
                        None,
                        ExecuteState::DispatchFailed,
                        ExecuteState::Waiting,
                        Some(now_millis()),
                        Some(event.message.clone()),
                    )
                    .await?;
                if !terminated {
                    debug!("派发失败的任务已不处于等待状态: {}", event.task_id);
                    return Ok(());
                }
            }
            let Some(instance) = self.instance_repo.get(event.instance_id).await? else {
                return Ok(());
            };
            if instance.is_terminal() {
                return Ok(());
            }
            self.settle(instance, true).await?
        };
        self.run_follow_ups(actions).await;
        Ok(())
    }

    /// 消费派发失败事件
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<DispatchFailedEvent>,
        parent: &CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let token = parent.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let task_id = event.task_id;
                        if let Err(e) = manager.process_dispatch_failed(event).await {
                            error!("处理派发失败事件出错 task_id={}: {}", task_id, e);
                        }
                    }
                }
            }
            debug!("派发失败事件处理已停止");
        })
    }

    // ----------------------------------------------------------------- instance operations

    pub async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        info!("暂停实例: {}", instance_id);
        let actions = {
            let _guard = self.instance_lock(instance_id).lock().await;
            let instance = self.require_instance(instance_id).await?;
            if !instance.run_state.is_pausable() {
                return Ok(false);
            }
            self.task_repo
                .update_state_by_instance(
                    instance_id,
                    ExecuteState::Paused,
                    &[ExecuteState::Waiting],
                    None,
                )
                .await?;
            let job = self.require_job(instance.job_id).await?;
            let executing = self.load_executing_tasks(&instance).await?;
            if executing.is_empty() {
                self.settle(instance, false).await?
            } else {
                vec![FollowUp::Dispatch(DispatchAction {
                    operation: Operation::Pause,
                    job,
                    instance,
                    tasks: executing,
                })]
            }
        };
        self.run_follow_ups(actions).await;
        Ok(true)
    }

    pub async fn cancel_instance(
        &self,
        instance_id: i64,
        operation: Operation,
    ) -> SchedulerResult<bool> {
        if !operation.to_state().is_failure() {
            return Err(SchedulerError::Unsupported(format!(
                "{operation}不是取消操作"
            )));
        }
        info!("取消实例: {}, {}", instance_id, operation);
        let actions = {
            let _guard = self.instance_lock(instance_id).lock().await;
            let mut instance = self.require_instance(instance_id).await?;
            if instance.is_terminal() {
                return Ok(false);
            }
            let now = now_millis();
            self.task_repo
                .update_state_by_instance(
                    instance_id,
                    operation.to_state(),
                    &[ExecuteState::Waiting, ExecuteState::Paused],
                    Some(now),
                )
                .await?;
            let job = self.require_job(instance.job_id).await?;
            let executing = self.load_executing_tasks(&instance).await?;
            if executing.is_empty() {
                let tasks = self.task_repo.find_by_instance(instance_id).await?;
                let states: Vec<ExecuteState> = tasks.iter().map(|t| t.execute_state).collect();
                let (run_state, end_time) = match obtain_run_state(&states) {
                    Some(state) if state.is_terminal() => {
                        (state, latest_end_time(&tasks).unwrap_or(now))
                    }
                    _ => (RunState::Canceled, now),
                };
                if self
                    .instance_repo
                    .terminate(instance_id, run_state, &RunState::TERMINABLE, end_time)
                    .await?
                {
                    instance.mark_terminated(run_state, end_time);
                    vec![FollowUp::Terminated {
                        instance,
                        follow_up: false,
                    }]
                } else {
                    Vec::new()
                }
            } else {
                vec![FollowUp::Dispatch(DispatchAction {
                    operation,
                    job,
                    instance,
                    tasks: executing,
                })]
            }
        };
        self.run_follow_ups(actions).await;
        Ok(true)
    }

    pub async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        info!("恢复实例: {}", instance_id);
        let actions = {
            let _guard = self.instance_lock(instance_id).lock().await;
            let instance = self.require_instance(instance_id).await?;
            if instance.run_state != RunState::Paused {
                return Ok(false);
            }
            if !self
                .instance_repo
                .update_state(instance_id, RunState::Waiting, &[RunState::Paused])
                .await?
            {
                return Ok(false);
            }
            self.task_repo
                .update_state_by_instance(
                    instance_id,
                    ExecuteState::Waiting,
                    &[ExecuteState::Paused],
                    None,
                )
                .await?;
            let job = self.require_job(instance.job_id).await?;
            let waiting: Vec<Task> = self
                .task_repo
                .find_by_instance(instance_id)
                .await?
                .into_iter()
                .filter(|t| t.execute_state == ExecuteState::Waiting)
                .collect();
            let instance = self.require_instance(instance_id).await?;
            vec![FollowUp::Dispatch(DispatchAction {
                operation: Operation::Trigger,
                job,
                instance,
                tasks: waiting,
            })]
        };
        self.run_follow_ups(actions).await;
        Ok(true)
    }

    /// 清理已失去执行者的实例
    ///
    /// 仍有WAITING任务或存活的执行中任务时不处理；其余执行中的任务视为Worker已死亡。
    pub async fn purge_instance(&self, instance: &Instance) -> SchedulerResult<bool> {
        let instance_id = instance.instance_id;
        info!("清理实例: {}", instance_id);
        let actions = {
            let _guard = self.instance_lock(instance_id).lock().await;
            let Some(mut instance) = self.instance_repo.get(instance_id).await? else {
                return Ok(false);
            };
            if !instance.run_state.is_pausable() {
                return Ok(false);
            }
            let tasks = self.task_repo.find_by_instance(instance_id).await?;
            if tasks.iter().any(|t| t.execute_state == ExecuteState::Waiting) {
                warn!("实例仍有等待中的任务，不能清理: {}", instance_id);
                return Ok(false);
            }
            if self.has_alive_executing(&tasks) {
                warn!("实例仍有存活的执行中任务，不能清理: {}", instance_id);
                return Ok(false);
            }

            let now = now_millis();
            // 已失去Worker的执行中任务按中止处理
            for task in tasks
                .iter()
                .filter(|t| t.execute_state == ExecuteState::Executing)
            {
                self.task_repo
                    .terminate(
                        task.task_id,
                        task.worker.as_ref(),
                        ExecuteState::ExecuteAborted,
                        ExecuteState::Executing,
                        Some(now),
                        Some("执行任务的Worker已下线".to_string()),
                    )
                    .await?;
            }
            let tasks = self.task_repo.find_by_instance(instance_id).await?;
            let states: Vec<ExecuteState> = tasks.iter().map(|t| t.execute_state).collect();
            let (run_state, end_time) = match obtain_run_state(&states) {
                _ if tasks.is_empty() => (RunState::Canceled, now),
                Some(RunState::Paused) => {
                    self.instance_repo
                        .update_state(instance_id, RunState::Paused, &RunState::PAUSABLE)
                        .await?;
                    return Ok(true);
                }
                Some(state) => (state, latest_end_time(&tasks).unwrap_or(now)),
                None => {
                    debug!("实例 {} 仍有活动任务，不能清理", instance_id);
                    return Ok(false);
                }
            };
            if !self
                .instance_repo
                .terminate(instance_id, run_state, &RunState::TERMINABLE, end_time)
                .await?
            {
                return Ok(false);
            }
            instance.mark_terminated(run_state, end_time);
            warn!("实例 {} 清理为{}", instance_id, run_state);
            vec![FollowUp::Terminated {
                instance,
                follow_up: true,
            }]
        };
        self.run_follow_ups(actions).await;
        Ok(true)
    }

    /// 以版本号为条件更新实例的下次扫描时间
    pub async fn update_instance_next_scan_time(
        &self,
        instance: &Instance,
        next_scan_time: i64,
    ) -> SchedulerResult<bool> {
        self.instance_repo
            .update_next_scan_time(instance.instance_id, instance.version, next_scan_time)
            .await
    }

    /// 重新派发等待中的任务
    pub async fn redispatch(&self, job: &Job, instance: &Instance, tasks: &[Task]) -> bool {
        info!(
            "重新派发实例 {} 的{}个任务",
            instance.instance_id,
            tasks.len()
        );
        self.dispatch(job, instance, tasks).await
    }

    /// 执行中且Worker仍存活的任务；Worker已下线的直接终止
    async fn load_executing_tasks(&self, instance: &Instance) -> SchedulerResult<Vec<Task>> {
        let mut executing = Vec::new();
        for task in self
            .task_repo
            .find_by_instance(instance.instance_id)
            .await?
        {
            if task.execute_state != ExecuteState::Executing {
                continue;
            }
            if self.is_alive_worker(task.worker.as_ref()) {
                executing.push(task);
                continue;
            }
            let terminated = self
                .task_repo
                .terminate(
                    task.task_id,
                    task.worker.as_ref(),
                    ExecuteState::ExecuteAborted,
                    ExecuteState::Executing,
                    Some(now_millis()),
                    None,
                )
                .await?;
            if terminated {
                info!("终止已下线Worker上的任务: {}", task.task_id);
            }
        }
        Ok(executing)
    }

    async fn require_instance(&self, instance_id: i64) -> SchedulerResult<Instance> {
        self.instance_repo
            .get(instance_id)
            .await?
            .ok_or(SchedulerError::InstanceNotFound { id: instance_id })
    }

    async fn require_job(&self, job_id: i64) -> SchedulerResult<Job> {
        self.job_repo
            .get(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: job_id })
    }

    // ----------------------------------------------------------------- after terminate

    /// 实例结束后：失败重试、触发依赖任务、更新FIXED_DELAY的下次触发时间
    ///
    /// `follow_up`为false表示人为暂停或取消，不再重试也不触发下游。
    async fn after_terminate(
        &self,
        instance: &Instance,
        follow_up: bool,
    ) -> SchedulerResult<Vec<DispatchAction>> {
        counter!("scheduler_instance_terminated_total", "state" => instance.run_state.to_string())
            .increment(1);
        let Some(job) = self.job_repo.get(instance.job_id).await? else {
            error!("实例所属任务不存在: {}", instance.job_id);
            return Ok(Vec::new());
        };

        let mut actions = Vec::new();
        let mut retrying = false;
        if follow_up {
            match instance.run_state {
                RunState::Canceled if job.retryable(instance.run_state, instance.retried_count) => {
                    match self.retry_instance(&job, instance).await {
                        Ok(action) => {
                            retrying = true;
                            actions.push(action);
                        }
                        Err(e) => error!("创建重试实例失败 {}: {}", instance.instance_id, e),
                    }
                }
                RunState::Finished => match self.fire_dependents(instance).await {
                    Ok(children) => actions.extend(children),
                    Err(e) => error!("触发依赖任务失败 {}: {}", instance.instance_id, e),
                },
                _ => {}
            }
        }

        if !retrying {
            self.update_fixed_delay_next_trigger_time(&job, instance)
                .await?;
        }
        Ok(actions)
    }

    async fn retry_instance(&self, job: &Job, prev: &Instance) -> SchedulerResult<DispatchAction> {
        let now = now_millis();
        let retried_count = prev.retried_count + 1;
        let retry_id = self.generate_id()?;
        let trigger_time = job.compute_retry_trigger_time(retried_count, now);

        let tasks = match job.retry_type {
            RetryType::All => self.split_tasks(job, retry_id, now).await?,
            RetryType::Failed => {
                let mut tasks = Vec::new();
                for task in self.task_repo.find_by_instance(prev.instance_id).await? {
                    if !task.execute_state.is_failure() {
                        continue;
                    }
                    // 广播任务只能在原Worker上重试
                    let worker = if job.route_strategy.is_broadcast() {
                        if !self.is_alive_worker(task.worker.as_ref()) {
                            continue;
                        }
                        task.worker.clone()
                    } else {
                        None
                    };
                    tasks.push(Task::create(
                        self.generate_id()?,
                        retry_id,
                        task.shard_index,
                        task.shard_count,
                        task.task_param,
                        worker,
                        now,
                    ));
                }
                tasks
            }
            RetryType::None => {
                return Err(SchedulerError::Unsupported("任务未配置重试".to_string()));
            }
        };
        if tasks.is_empty() {
            return Err(SchedulerError::StateConflict(format!(
                "没有可重试的任务: {}",
                prev.instance_id
            )));
        }

        let mut instance = Instance::create(
            retry_id,
            job.job_id,
            RunType::Retry,
            trigger_time,
            retried_count,
            now,
        );
        instance.parent_instance_id = Some(prev.instance_id);
        instance.root_instance_id = Some(prev.obtain_root_instance_id());
        let triggered = TriggeredInstance { instance, tasks };
        self.instance_repo.insert(&triggered).await?;
        counter!("scheduler_instance_triggered_total", "run_type" => RunType::Retry.name())
            .increment(1);
        info!(
            "实例 {} 第{}次重试: {}",
            prev.instance_id, retried_count, retry_id
        );
        Ok(DispatchAction {
            operation: Operation::Trigger,
            job: job.clone(),
            instance: triggered.instance,
            tasks: triggered.tasks,
        })
    }

    /// 父任务完成后触发依赖它的子任务：子任务上次触发之后所有父任务都已完成才触发
    async fn fire_dependents(&self, parent: &Instance) -> SchedulerResult<Vec<DispatchAction>> {
        let mut actions = Vec::new();
        for mut child in self.job_repo.find_dependents(parent.job_id).await? {
            if !child.is_enabled() {
                continue;
            }
            if !self.all_parents_finished(&child, parent).await? {
                debug!("子任务 {} 的父任务尚未全部完成", child.job_id);
                continue;
            }

            let now = now_millis();
            let mut triggered = match self.create_triggered(&child, RunType::Depend, now, now).await
            {
                Ok(t) => t,
                Err(e) => {
                    error!("创建依赖任务实例失败 {}: {}", child.job_id, e);
                    continue;
                }
            };
            triggered.instance.parent_instance_id = Some(parent.instance_id);
            triggered.instance.root_instance_id = Some(parent.obtain_root_instance_id());
            child.last_trigger_time = Some(now);
            match self.job_repo.commit_trigger(&child, &triggered).await {
                Ok(true) => {
                    counter!("scheduler_instance_triggered_total", "run_type" => RunType::Depend.name())
                        .increment(1);
                    info!(
                        "父实例 {} 触发子任务 {}: {}",
                        parent.instance_id, child.job_id, triggered.instance.instance_id
                    );
                    actions.push(DispatchAction {
                        operation: Operation::Trigger,
                        job: child,
                        instance: triggered.instance,
                        tasks: triggered.tasks,
                    });
                }
                Ok(false) => debug!("子任务 {} 已被其它进程触发", child.job_id),
                Err(SchedulerError::DuplicateKey(msg)) => {
                    debug!("子任务 {} 重复触发: {}", child.job_id, msg)
                }
                Err(e) => error!("保存依赖任务实例失败 {}: {}", child.job_id, e),
            }
        }
        Ok(actions)
    }

    async fn all_parents_finished(&self, child: &Job, parent: &Instance) -> SchedulerResult<bool> {
        let since = child.last_trigger_time;
        for parent_job_id in child.parent_job_ids()? {
            let end_time = if parent_job_id == parent.job_id {
                parent.run_end_time
            } else {
                self.instance_repo
                    .find_latest_finished(parent_job_id)
                    .await?
                    .and_then(|i| i.run_end_time)
            };
            let finished = match (end_time, since) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(end), Some(last)) => end > last,
            };
            if !finished {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// FIXED_DELAY任务以根实例的完成时间为基准计算下次触发时间
    async fn update_fixed_delay_next_trigger_time(
        &self,
        job: &Job,
        instance: &Instance,
    ) -> SchedulerResult<()> {
        if job.trigger_type != TriggerType::FixedDelay {
            return Ok(());
        }
        let root_id = instance.obtain_root_instance_id();
        let root_run_type = if root_id == instance.instance_id {
            Some(instance.run_type)
        } else {
            self.instance_repo.get(root_id).await?.map(|r| r.run_type)
        };
        if root_run_type != Some(RunType::Schedule) {
            return Ok(());
        }
        if job.next_trigger_time != Some(AWAITING_COMPLETION) {
            debug!("FIXED_DELAY任务不处于等待完成状态: {}", job.job_id);
            return Ok(());
        }

        let now = now_millis();
        let end_time = instance.run_end_time.unwrap_or(now);
        let anchor = job
            .trigger_type
            .next_fire_time(&job.trigger_value, end_time)?;
        let next = [Some(now), job.start_time, anchor]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(now);
        if self
            .job_repo
            .update_fixed_delay_next_trigger_time(job.job_id, next)
            .await?
        {
            debug!("FIXED_DELAY任务 {} 下次触发时间: {}", job.job_id, next);
        }
        Ok(())
    }
}

fn latest_end_time(tasks: &[Task]) -> Option<i64> {
    tasks.iter().filter_map(|t| t.execute_end_time).max()
}
