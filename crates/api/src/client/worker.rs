use std::sync::Arc;

use async_trait::async_trait;

use scheduler_core::{
    models::{ExecuteTaskParam, JobHandlerParam, Server, Worker},
    traits::{Discovery, TaskTransport, WorkerRpc},
    SchedulerError, SchedulerResult,
};

use super::RpcClient;
use crate::types::{paths, DispatchRequest};

/// Supervisor -> Worker：按分组调用，失败时换同组的下一个Worker
pub struct HttpWorkerRpc {
    client: RpcClient,
    discovery: Arc<dyn Discovery<Worker>>,
}

impl HttpWorkerRpc {
    pub fn new(client: RpcClient, discovery: Arc<dyn Discovery<Worker>>) -> Self {
        Self { client, discovery }
    }

    async fn call_group<T>(&self, path: &str, param: &JobHandlerParam) -> SchedulerResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let workers = self.discovery.discovered_servers(Some(&param.group));
        if workers.is_empty() {
            return Err(SchedulerError::NoAvailableWorker {
                group: param.group.clone(),
            });
        }
        self.client
            .retry_policy()
            .call(workers.as_slice(), path, |worker| {
                let address = worker.address();
                async move { self.client.post(&address, path, param).await }
            })
            .await
    }
}

#[async_trait]
impl WorkerRpc for HttpWorkerRpc {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool> {
        self.call_group(paths::WORKER_VERIFY, param).await
    }

    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>> {
        self.call_group(paths::WORKER_SPLIT, param).await
    }
}

/// 派发到指定Worker，不在这里重试，由派发器换节点重投
pub struct HttpTaskTransport {
    client: RpcClient,
}

impl HttpTaskTransport {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskTransport for HttpTaskTransport {
    async fn dispatch(&self, worker: &Worker, params: &[ExecuteTaskParam]) -> SchedulerResult<()> {
        let request = DispatchRequest {
            worker: worker.clone(),
            params: params.to_vec(),
        };
        self.client
            .post(&worker.address(), paths::WORKER_DISPATCH, &request)
            .await
    }
}
