use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use scheduler_core::{
    models::{
        Operation, SavepointParam, Server, StartTaskParam, StopTaskParam, Supervisor, Task,
    },
    traits::{Discovery, SupervisorRpc},
    SchedulerResult,
};

use super::RpcClient;
use crate::types::{paths, CancelInstanceRequest, InstanceIdRequest, JobIdRequest, TaskIdRequest};

/// Worker -> Supervisor：在发现的Supervisor之间轮询重试
pub struct HttpSupervisorRpc {
    client: RpcClient,
    discovery: Arc<dyn Discovery<Supervisor>>,
}

impl HttpSupervisorRpc {
    pub fn new(client: RpcClient, discovery: Arc<dyn Discovery<Supervisor>>) -> Self {
        Self { client, discovery }
    }

    async fn call<B, T>(&self, path: &str, body: &B) -> SchedulerResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let supervisors = self.discovery.discovered_servers(None);
        self.client
            .retry_policy()
            .call(supervisors.as_slice(), path, |supervisor| {
                let address = supervisor.address();
                async move { self.client.post(&address, path, body).await }
            })
            .await
    }
}

#[async_trait]
impl SupervisorRpc for HttpSupervisorRpc {
    async fn get_task(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        self.call(paths::SUPERVISOR_GET_TASK, &TaskIdRequest { task_id })
            .await
    }

    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        self.call(paths::SUPERVISOR_START_TASK, param).await
    }

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        self.call(paths::SUPERVISOR_STOP_TASK, param).await
    }

    async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool> {
        self.call(paths::SUPERVISOR_SAVEPOINT, param).await
    }

    async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        self.call(paths::SUPERVISOR_TRIGGER_JOB, &JobIdRequest { job_id })
            .await
    }

    async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.call(
            paths::SUPERVISOR_PAUSE_INSTANCE,
            &InstanceIdRequest { instance_id },
        )
        .await
    }

    async fn cancel_instance(
        &self,
        instance_id: i64,
        operation: Operation,
    ) -> SchedulerResult<bool> {
        self.call(
            paths::SUPERVISOR_CANCEL_INSTANCE,
            &CancelInstanceRequest {
                instance_id,
                operation,
            },
        )
        .await
    }

    async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.call(
            paths::SUPERVISOR_RESUME_INSTANCE,
            &InstanceIdRequest { instance_id },
        )
        .await
    }
}
