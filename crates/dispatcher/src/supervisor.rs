use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use scheduler_core::{
    config::SupervisorConfig,
    heartbeat::{spawn_heartbeat, Heartbeat, HeartbeatHandle},
    id_generator::IdGenerator,
    models::{Supervisor, Worker},
    traits::{
        Discovery, DistributedLock, InstanceRepository, JobRepository, Registry, TaskRepository,
        TaskTransport, WorkerRpc,
    },
    SchedulerResult,
};

use crate::job_manager::{JobManager, JobManagerConfig};
use crate::recovery_service::{RecoveryConfig, RunningInstanceScanner, WaitingInstanceScanner};
use crate::rpc_service::SupervisorRpcService;
use crate::scheduler::{TriggeringJobScanner, TriggeringJobScannerConfig};
use crate::task_dispatcher::{
    DispatchFailedEvent, LocalTarget, TaskDispatcher, TaskDispatcherConfig,
};

pub const TRIGGERING_JOB_LOCK: &str = "scan_triggering_job";
pub const WAITING_INSTANCE_LOCK: &str = "scan_waiting_instance";
pub const RUNNING_INSTANCE_LOCK: &str = "scan_running_instance";

/// 三个扫描器各自的分布式锁
pub struct ScannerLocks {
    pub triggering: Arc<dyn DistributedLock>,
    pub waiting: Arc<dyn DistributedLock>,
    pub running: Arc<dyn DistributedLock>,
}

/// Supervisor运行所需的外部组件
pub struct SupervisorDeps {
    pub job_repo: Arc<dyn JobRepository>,
    pub instance_repo: Arc<dyn InstanceRepository>,
    pub task_repo: Arc<dyn TaskRepository>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub discovery: Arc<dyn Discovery<Worker>>,
    pub registry: Arc<dyn Registry<Supervisor>>,
    pub transport: Arc<dyn TaskTransport>,
    pub worker_rpc: Arc<dyn WorkerRpc>,
    pub locks: ScannerLocks,
    /// 同进程内嵌的Worker
    pub local: Option<LocalTarget>,
}

/// Supervisor节点：组装派发器、任务管理与三个扫描器
pub struct SupervisorNode {
    server: Supervisor,
    config: SupervisorConfig,
    manager: Arc<JobManager>,
    dispatcher: Arc<TaskDispatcher>,
    rpc: Arc<SupervisorRpcService>,
    registry: Arc<dyn Registry<Supervisor>>,
    scanners: Vec<(Arc<dyn Heartbeat>, u64)>,
    failed_events: Option<mpsc::UnboundedReceiver<DispatchFailedEvent>>,
    cancel: CancellationToken,
    heartbeats: Vec<HeartbeatHandle>,
    loops: Vec<JoinHandle<()>>,
}

impl SupervisorNode {
    pub fn new(server: Supervisor, deps: SupervisorDeps, config: SupervisorConfig) -> Self {
        let (dispatcher, failed_events) = TaskDispatcher::new(
            deps.discovery,
            deps.transport,
            deps.task_repo.clone(),
            deps.local,
            Some(TaskDispatcherConfig {
                retry_max_count: config.dispatch_retry_max_count,
                retry_backoff_ms: config.dispatch_retry_backoff_ms,
                virtual_node_count: config.virtual_node_count,
                ..Default::default()
            }),
        );
        let dispatcher = Arc::new(dispatcher);
        let manager = Arc::new(JobManager::new(
            deps.job_repo,
            deps.instance_repo,
            deps.task_repo,
            deps.id_generator,
            dispatcher.clone(),
            deps.worker_rpc,
            Some(JobManagerConfig::default()),
        ));

        let triggering = TriggeringJobScanner::new(
            manager.clone(),
            deps.locks.triggering,
            Some(TriggeringJobScannerConfig {
                period_ms: config.scan_triggering_job_period_ms,
                batch_size: config.scan_batch_size,
                process_concurrency: config.process_concurrency,
                max_scan_failed_count: config.max_scan_failed_count,
            }),
        );
        let waiting = WaitingInstanceScanner::new(
            manager.clone(),
            deps.locks.waiting,
            RecoveryConfig::waiting(config.scan_waiting_instance_period_ms, config.scan_batch_size),
        );
        let running = RunningInstanceScanner::new(
            manager.clone(),
            deps.locks.running,
            RecoveryConfig::running(config.scan_running_instance_period_ms, config.scan_batch_size),
        );
        let scanners: Vec<(Arc<dyn Heartbeat>, u64)> = vec![
            (Arc::new(triggering), config.scan_triggering_job_period_ms),
            (Arc::new(waiting), config.scan_waiting_instance_period_ms),
            (Arc::new(running), config.scan_running_instance_period_ms),
        ];

        Self {
            server,
            config,
            rpc: Arc::new(SupervisorRpcService::new(manager.clone())),
            manager,
            dispatcher,
            registry: deps.registry,
            scanners,
            failed_events: Some(failed_events),
            cancel: CancellationToken::new(),
            heartbeats: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn server(&self) -> &Supervisor {
        &self.server
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn rpc(&self) -> &Arc<SupervisorRpcService> {
        &self.rpc
    }

    /// 注册到注册中心并启动后台循环
    pub async fn start(&mut self) -> SchedulerResult<()> {
        info!("启动Supervisor: {}", self.server);
        self.registry.register(&self.server).await?;

        self.loops.push(self.dispatcher.start(&self.cancel));
        if let Some(events) = self.failed_events.take() {
            self.loops
                .push(self.manager.spawn_event_loop(events, &self.cancel));
        }
        for (scanner, period_ms) in &self.scanners {
            self.heartbeats
                .push(spawn_heartbeat(scanner.clone(), *period_ms, &self.cancel));
        }
        info!(
            "Supervisor已启动，扫描周期: {}ms/{}ms/{}ms",
            self.config.scan_triggering_job_period_ms,
            self.config.scan_waiting_instance_period_ms,
            self.config.scan_running_instance_period_ms
        );
        Ok(())
    }

    /// 停止扫描并从注册中心下线
    pub async fn stop(mut self) {
        info!("停止Supervisor: {}", self.server);
        self.cancel.cancel();
        for heartbeat in self.heartbeats.drain(..) {
            heartbeat.stop().await;
        }
        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                error!("后台任务退出异常: {}", e);
            }
        }
        if let Err(e) = self.registry.deregister(&self.server).await {
            error!("Supervisor注销失败: {}", e);
        }
        self.registry.close().await;
        info!("Supervisor已停止");
    }
}
