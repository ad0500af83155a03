use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use scheduler_core::{
    models::{Operation, SavepointParam, StartTaskParam, StopTaskParam, Task},
    traits::SupervisorRpc,
    SchedulerResult,
};

use crate::job_manager::JobManager;

/// Supervisor对外暴露的RPC实现，HTTP层和进程内Worker共用
pub struct SupervisorRpcService {
    manager: Arc<JobManager>,
}

impl SupervisorRpcService {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }
}

#[async_trait]
impl SupervisorRpc for SupervisorRpcService {
    async fn get_task(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        self.manager.task_repo().get(task_id).await
    }

    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        self.manager.start_task(param).await
    }

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        debug!(
            "收到任务结束上报: task_id={}, operation={}, to_state={}",
            param.task_id, param.operation, param.to_state
        );
        self.manager.stop_task(param).await
    }

    async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool> {
        self.manager.savepoint(param).await
    }

    async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        self.manager.trigger_job(job_id).await
    }

    async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.manager.pause_instance(instance_id).await
    }

    async fn cancel_instance(
        &self,
        instance_id: i64,
        operation: Operation,
    ) -> SchedulerResult<bool> {
        self.manager.cancel_instance(instance_id, operation).await
    }

    async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.manager.resume_instance(instance_id).await
    }
}
