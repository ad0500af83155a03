use async_trait::async_trait;

use crate::{
    models::{
        ExecuteTaskParam, JobHandlerParam, Operation, SavepointParam, StartTaskParam,
        StopTaskParam, Task, Worker,
    },
    SchedulerResult,
};

/// Supervisor -> Worker：按分组调用的处理器接口
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool>;

    /// 返回每个分片的任务参数
    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>>;
}

/// Supervisor -> Worker：把一批任务派发给指定Worker执行
#[async_trait]
pub trait TaskTransport: Send + Sync {
    async fn dispatch(&self, worker: &Worker, params: &[ExecuteTaskParam]) -> SchedulerResult<()>;
}

/// Worker -> Supervisor：上报分片任务的执行进度
#[async_trait]
pub trait SupervisorRpc: Send + Sync {
    async fn get_task(&self, task_id: i64) -> SchedulerResult<Option<Task>>;

    /// 抢占执行权，成功时返回最新的任务数据
    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>>;

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool>;

    async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool>;

    /// 手动触发
    async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64>;

    async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool>;

    async fn cancel_instance(&self, instance_id: i64, operation: Operation)
        -> SchedulerResult<bool>;

    async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool>;
}
