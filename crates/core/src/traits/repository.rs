use async_trait::async_trait;

use crate::{
    models::{ExecuteState, Instance, Job, JobState, RunState, RunType, Task, Worker},
    SchedulerResult,
};

/// 一次触发产生的实例及其分片任务
#[derive(Debug, Clone)]
pub struct TriggeredInstance {
    pub instance: Instance,
    pub tasks: Vec<Task>,
}

/// 任务定义仓储接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 新增任务，返回分配的ID
    async fn insert(&self, job: Job) -> SchedulerResult<i64>;

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<Job>>;

    /// 查询`next_trigger_time < max_next_trigger_time`且`next_scan_time <= now`的启用任务
    async fn find_due(
        &self,
        max_next_trigger_time: i64,
        now: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<Job>>;

    /// 查询DEPEND类型且依赖了指定父任务的子任务
    async fn find_dependents(&self, parent_job_id: i64) -> SchedulerResult<Vec<Job>>;

    /// 按版本号更新调度游标(last/next trigger time、job_state、remark)，版本冲突返回false
    async fn update_trigger_time(&self, job: &Job) -> SchedulerResult<bool>;

    /// 版本检查通过后，在同一事务中更新调度游标并写入实例与分片任务
    async fn commit_trigger(
        &self,
        job: &Job,
        triggered: &TriggeredInstance,
    ) -> SchedulerResult<bool>;

    /// 推迟扫描
    async fn update_next_scan_time(
        &self,
        job_id: i64,
        expect_version: i64,
        next_scan_time: i64,
        scan_failed_count: u32,
    ) -> SchedulerResult<bool>;

    async fn update_state(&self, job_id: i64, state: JobState, remark: Option<String>)
        -> SchedulerResult<bool>;

    /// FIXED_DELAY实例完成后更新下次触发时间
    async fn update_fixed_delay_next_trigger_time(
        &self,
        job_id: i64,
        next_trigger_time: i64,
    ) -> SchedulerResult<bool>;
}

/// 任务实例仓储接口
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn get(&self, instance_id: i64) -> SchedulerResult<Option<Instance>>;

    /// 写入实例及其分片任务，(job_id, trigger_time, run_type)唯一
    async fn insert(&self, triggered: &TriggeredInstance) -> SchedulerResult<()>;

    async fn find_by_trigger(
        &self,
        job_id: i64,
        trigger_time: i64,
        run_type: RunType,
    ) -> SchedulerResult<Option<Instance>>;

    /// 同一根实例下的全部实例(含重试)
    async fn find_by_root(&self, root_instance_id: i64) -> SchedulerResult<Vec<Instance>>;

    /// 该任务最近一次运行结束的实例
    async fn find_latest_finished(&self, job_id: i64) -> SchedulerResult<Option<Instance>>;

    /// 处于`run_state`且`next_scan_time < expire_time`的实例
    async fn find_expired(
        &self,
        run_state: RunState,
        expire_time: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<Instance>>;

    /// 以版本号为条件更新下次扫描时间，同时刷新心跳
    async fn update_next_scan_time(
        &self,
        instance_id: i64,
        expect_version: i64,
        next_scan_time: i64,
    ) -> SchedulerResult<bool>;

    /// WAITING -> RUNNING
    async fn start(&self, instance_id: i64, now: i64) -> SchedulerResult<bool>;

    async fn update_state(
        &self,
        instance_id: i64,
        to: RunState,
        from: &[RunState],
    ) -> SchedulerResult<bool>;

    async fn terminate(
        &self,
        instance_id: i64,
        to: RunState,
        from: &[RunState],
        run_end_time: i64,
    ) -> SchedulerResult<bool>;
}

/// 分片任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get(&self, task_id: i64) -> SchedulerResult<Option<Task>>;

    async fn find_by_instance(&self, instance_id: i64) -> SchedulerResult<Vec<Task>>;

    /// WAITING -> EXECUTING，要求任务未分配或已分配给同一个Worker
    async fn start(&self, task_id: i64, worker: &Worker, now: i64) -> SchedulerResult<bool>;

    /// 比较并交换执行状态，`worker`不为空时要求匹配
    async fn terminate(
        &self,
        task_id: i64,
        worker: Option<&Worker>,
        to: ExecuteState,
        from: ExecuteState,
        execute_end_time: Option<i64>,
        error_msg: Option<String>,
    ) -> SchedulerResult<bool>;

    /// 批量迁移实例下处于`from`状态的任务，返回影响行数
    async fn update_state_by_instance(
        &self,
        instance_id: i64,
        to: ExecuteState,
        from: &[ExecuteState],
        execute_end_time: Option<i64>,
    ) -> SchedulerResult<usize>;

    /// 更新WAITING任务的分配Worker，`None`表示清空
    async fn update_worker(&self, task_ids: &[i64], worker: Option<&Worker>)
        -> SchedulerResult<usize>;

    async fn savepoint(
        &self,
        task_id: i64,
        worker: &Worker,
        snapshot: &str,
    ) -> SchedulerResult<bool>;
}
