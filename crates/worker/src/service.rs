use std::sync::Arc;

use tracing::{error, info};

use scheduler_core::{
    config::WorkerConfig,
    models::Worker,
    traits::{JobHandler, Registry, SupervisorRpc},
    SchedulerResult,
};

use crate::handler_registry::HandlerRegistry;
use crate::pool::{WorkerPoolConfig, WorkerThreadPool};
use crate::rpc_service::WorkerRpcService;
use crate::runner::TaskRunner;

/// 根据配置生成Worker身份，未配置worker_id时随机生成
pub fn worker_identity(config: &WorkerConfig) -> Worker {
    let worker_id = config
        .worker_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    Worker::new(config.group.clone(), worker_id, config.host.clone(), config.port)
}

/// Worker节点构建器
pub struct WorkerNodeBuilder {
    worker: Worker,
    registry: Arc<dyn Registry<Worker>>,
    supervisor: Arc<dyn SupervisorRpc>,
    handlers: HandlerRegistry,
    pool_config: WorkerPoolConfig,
}

impl WorkerNodeBuilder {
    pub fn new(
        worker: Worker,
        registry: Arc<dyn Registry<Worker>>,
        supervisor: Arc<dyn SupervisorRpc>,
    ) -> Self {
        Self {
            worker,
            registry,
            supervisor,
            handlers: HandlerRegistry::with_builtin(),
            pool_config: WorkerPoolConfig::default(),
        }
    }

    pub fn config(mut self, config: &WorkerConfig) -> Self {
        self.pool_config = WorkerPoolConfig {
            maximum_pool_size: config.maximum_pool_size,
            queue_capacity: config.queue_capacity,
            keep_alive_time_ms: config.keep_alive_time_ms,
            shutdown_timeout_ms: config.shutdown_timeout_ms,
        };
        self
    }

    pub fn pool_config(mut self, pool_config: WorkerPoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.register(name, handler);
        self
    }

    pub fn build(self) -> WorkerNode {
        let handlers = Arc::new(self.handlers);
        let runner = TaskRunner::new(self.worker.clone(), handlers.clone(), self.supervisor);
        let pool = Arc::new(WorkerThreadPool::new(runner, Some(self.pool_config)));
        let rpc = Arc::new(WorkerRpcService::new(
            self.worker.clone(),
            handlers,
            pool.clone(),
        ));
        WorkerNode {
            worker: self.worker,
            registry: self.registry,
            pool,
            rpc,
        }
    }
}

/// Worker节点：执行线程池加注册中心
pub struct WorkerNode {
    worker: Worker,
    registry: Arc<dyn Registry<Worker>>,
    pool: Arc<WorkerThreadPool>,
    rpc: Arc<WorkerRpcService>,
}

impl WorkerNode {
    pub fn builder(
        worker: Worker,
        registry: Arc<dyn Registry<Worker>>,
        supervisor: Arc<dyn SupervisorRpc>,
    ) -> WorkerNodeBuilder {
        WorkerNodeBuilder::new(worker, registry, supervisor)
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn rpc(&self) -> &Arc<WorkerRpcService> {
        &self.rpc
    }

    pub fn pool(&self) -> &Arc<WorkerThreadPool> {
        &self.pool
    }

    /// 先启动线程池再注册，注册后即可接收派发
    pub async fn start(&self) -> SchedulerResult<()> {
        info!("启动Worker: {}", self.worker);
        self.pool.start();
        self.registry.register(&self.worker).await?;
        info!("Worker已启动: {}", self.worker);
        Ok(())
    }

    /// 先注销不再接收新任务，再关闭线程池
    pub async fn stop(&self) {
        info!("停止Worker: {}", self.worker);
        if let Err(e) = self.registry.deregister(&self.worker).await {
            error!("Worker注销失败: {}", e);
        }
        self.pool.close().await;
        self.registry.close().await;
        info!("Worker已停止");
    }
}
