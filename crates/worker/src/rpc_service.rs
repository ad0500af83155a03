use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use scheduler_core::{
    models::{ExecuteTaskParam, JobHandlerParam, Worker},
    traits::{TaskTransport, WorkerRpc},
    SchedulerError, SchedulerResult,
};

use crate::handler_registry::HandlerRegistry;
use crate::pool::WorkerThreadPool;

/// Worker端RPC：处理器校验、拆分与任务接收
///
/// 同时实现`TaskTransport`，供同进程的Supervisor直接派发。
pub struct WorkerRpcService {
    worker: Worker,
    handlers: Arc<HandlerRegistry>,
    pool: Arc<WorkerThreadPool>,
}

impl WorkerRpcService {
    pub fn new(worker: Worker, handlers: Arc<HandlerRegistry>, pool: Arc<WorkerThreadPool>) -> Self {
        Self {
            worker,
            handlers,
            pool,
        }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// 接收派发的任务
    pub async fn receive(&self, params: Vec<ExecuteTaskParam>) -> SchedulerResult<()> {
        debug!("收到{}个任务指令", params.len());
        self.pool.submit(params).await
    }
}

#[async_trait]
impl WorkerRpc for WorkerRpcService {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool> {
        let Some(handler) = self.handlers.get(&param.job_handler) else {
            warn!("校验失败，找不到任务处理器: {}", param.job_handler);
            return Ok(false);
        };
        handler.verify(param).await
    }

    async fn split(&self, param: &JobHandlerParam) -> SchedulerResult<Vec<String>> {
        let handler = self.handlers.get(&param.job_handler).ok_or_else(|| {
            SchedulerError::InvalidJobParam(format!("找不到任务处理器: {}", param.job_handler))
        })?;
        handler.split(param).await
    }
}

#[async_trait]
impl TaskTransport for WorkerRpcService {
    async fn dispatch(&self, worker: &Worker, params: &[ExecuteTaskParam]) -> SchedulerResult<()> {
        if worker != &self.worker {
            return Err(SchedulerError::Rpc {
                status: Some(400),
                message: format!("任务派发到了错误的Worker: {worker}"),
            });
        }
        self.receive(params.to_vec()).await
    }
}
