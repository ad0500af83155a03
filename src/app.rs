use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scheduler_api::{
    create_app, supervisor_routes, worker_routes, HttpSupervisorRpc, HttpTaskTransport,
    HttpWorkerRpc, RpcClient,
};
use scheduler_core::{
    config::{AppConfig, LockKind, RegistryKind},
    id_generator::Snowflake,
    models::{
        Operation, SavepointParam, Server, StartTaskParam, StopTaskParam, Supervisor, Task,
        Worker,
    },
    traits::{Discovery, DistributedLock, Registry, SupervisorRpc, TaskTransport, WorkerRpc},
    SchedulerError, SchedulerResult,
};
use scheduler_dispatcher::{
    supervisor::{RUNNING_INSTANCE_LOCK, TRIGGERING_JOB_LOCK, WAITING_INSTANCE_LOCK},
    LocalTarget, ScannerLocks, SupervisorDeps, SupervisorNode,
};
use scheduler_infrastructure::{LocalLock, MemoryRegistry, MemoryStore, RedisLock, RedisRegistry};
use scheduler_worker::{worker_identity, WorkerNode};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Supervisor
    Supervisor,
    /// 仅运行Worker
    Worker,
    /// 同一进程内运行Supervisor和Worker
    All,
}

impl AppMode {
    pub fn runs_supervisor(self) -> bool {
        matches!(self, AppMode::Supervisor | AppMode::All)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "supervisor" => Ok(AppMode::Supervisor),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow!("不支持的运行模式: {s}")),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::Supervisor => "supervisor",
            AppMode::Worker => "worker",
            AppMode::All => "all",
        };
        f.write_str(name)
    }
}

/// 同一个注册中心实例的注册与发现两个视角
struct ServerRegistry<S: Server> {
    registry: Arc<dyn Registry<S>>,
    discovery: Arc<dyn Discovery<S>>,
}

impl<S: Server> ServerRegistry<S> {
    async fn create(config: &AppConfig) -> Result<Self> {
        match config.registry.kind {
            RegistryKind::Memory => {
                let registry = Arc::new(MemoryRegistry::<S>::new());
                Ok(Self {
                    registry: registry.clone(),
                    discovery: registry,
                })
            }
            RegistryKind::Redis => {
                let registry = RedisRegistry::<S>::connect(&config.redis.url, &config.registry)
                    .await
                    .with_context(|| format!("连接Redis注册中心失败: {}", config.redis.url))?;
                Ok(Self {
                    registry: registry.clone(),
                    discovery: registry,
                })
            }
        }
    }
}

async fn create_locks(config: &AppConfig, owner: &str) -> Result<ScannerLocks> {
    match config.lock.kind {
        LockKind::Local => Ok(ScannerLocks {
            triggering: Arc::new(LocalLock::new(TRIGGERING_JOB_LOCK)),
            waiting: Arc::new(LocalLock::new(WAITING_INSTANCE_LOCK)),
            running: Arc::new(LocalLock::new(RUNNING_INSTANCE_LOCK)),
        }),
        LockKind::Redis => {
            let conn = RedisLock::connection(&config.redis.url)
                .await
                .with_context(|| format!("连接Redis失败: {}", config.redis.url))?;
            let lock = |name: &str| -> Arc<dyn DistributedLock> {
                Arc::new(RedisLock::new(
                    conn.clone(),
                    &config.registry.namespace,
                    name,
                    owner,
                    config.lock.lease_ms,
                ))
            };
            Ok(ScannerLocks {
                triggering: lock(TRIGGERING_JOB_LOCK),
                waiting: lock(WAITING_INSTANCE_LOCK),
                running: lock(RUNNING_INSTANCE_LOCK),
            })
        }
    }
}

/// all模式下Worker先于Supervisor创建，Supervisor就绪后再注入
#[derive(Default)]
struct LocalSupervisorRpc {
    inner: OnceLock<Arc<dyn SupervisorRpc>>,
}

impl LocalSupervisorRpc {
    fn set(&self, rpc: Arc<dyn SupervisorRpc>) {
        if self.inner.set(rpc).is_err() {
            warn!("本地Supervisor已经设置过");
        }
    }

    fn get(&self) -> SchedulerResult<&Arc<dyn SupervisorRpc>> {
        self.inner
            .get()
            .ok_or_else(|| SchedulerError::Internal("本地Supervisor尚未启动".to_string()))
    }
}

#[async_trait]
impl SupervisorRpc for LocalSupervisorRpc {
    async fn get_task(&self, task_id: i64) -> SchedulerResult<Option<Task>> {
        self.get()?.get_task(task_id).await
    }

    async fn start_task(&self, param: &StartTaskParam) -> SchedulerResult<Option<Task>> {
        self.get()?.start_task(param).await
    }

    async fn stop_task(&self, param: &StopTaskParam) -> SchedulerResult<bool> {
        self.get()?.stop_task(param).await
    }

    async fn savepoint(&self, param: &SavepointParam) -> SchedulerResult<bool> {
        self.get()?.savepoint(param).await
    }

    async fn trigger_job(&self, job_id: i64) -> SchedulerResult<i64> {
        self.get()?.trigger_job(job_id).await
    }

    async fn pause_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.get()?.pause_instance(instance_id).await
    }

    async fn cancel_instance(
        &self,
        instance_id: i64,
        operation: Operation,
    ) -> SchedulerResult<bool> {
        self.get()?.cancel_instance(instance_id, operation).await
    }

    async fn resume_instance(&self, instance_id: i64) -> SchedulerResult<bool> {
        self.get()?.resume_instance(instance_id).await
    }
}

fn install_prometheus(address: &str) -> Result<()> {
    let addr: SocketAddr = address
        .parse()
        .with_context(|| format!("无效的Prometheus监听地址: {address}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;
    info!("Prometheus指标导出: http://{}/metrics", addr);
    Ok(())
}

async fn spawn_server(
    bind_address: &str,
    app: axum::Router,
    cancel: &CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("绑定地址失败: {bind_address}"))?;
    let local_addr = listener.local_addr().context("获取监听地址失败")?;
    let shutdown = cancel.clone().cancelled_owned();
    let handle = tokio::spawn(async move {
        if let Err(e) = scheduler_api::serve(listener, app, shutdown).await {
            error!("HTTP服务运行失败: {}", e);
        }
    });
    Ok((local_addr, handle))
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Self {
        Self { config, mode }
    }

    /// 按运行模式组装并启动各组件
    pub async fn start(self) -> Result<RunningApp> {
        let Application { config, mode } = self;
        info!("启动应用程序，模式: {}", mode);

        if mode != AppMode::All && config.registry.kind == RegistryKind::Memory {
            return Err(anyhow!(
                "{mode}模式需要跨进程共享的注册中心，请将registry.kind设置为redis"
            ));
        }
        if let Some(address) = &config.observability.prometheus_address {
            install_prometheus(address)?;
        }

        let client = RpcClient::new(&config.http).context("创建RPC客户端失败")?;
        let workers = ServerRegistry::<Worker>::create(&config).await?;
        let supervisors = ServerRegistry::<Supervisor>::create(&config).await?;
        let local_supervisor = Arc::new(LocalSupervisorRpc::default());

        let worker_node = if mode.runs_worker() {
            let supervisor_rpc: Arc<dyn SupervisorRpc> = if mode == AppMode::All {
                local_supervisor.clone()
            } else {
                Arc::new(HttpSupervisorRpc::new(
                    client.clone(),
                    supervisors.discovery.clone(),
                ))
            };
            Some(
                WorkerNode::builder(
                    worker_identity(&config.worker),
                    workers.registry.clone(),
                    supervisor_rpc,
                )
                .config(&config.worker)
                .build(),
            )
        } else {
            None
        };

        let mut store = None;
        let mut supervisor_node = if mode.runs_supervisor() {
            let server = Supervisor::new(config.supervisor.host.clone(), config.supervisor.port);
            let memory = Arc::new(MemoryStore::new());
            let (worker_rpc, local): (Arc<dyn WorkerRpc>, Option<LocalTarget>) = match &worker_node
            {
                Some(node) => (
                    node.rpc().clone() as Arc<dyn WorkerRpc>,
                    Some((
                        node.worker().clone(),
                        node.rpc().clone() as Arc<dyn TaskTransport>,
                    )),
                ),
                None => (
                    Arc::new(HttpWorkerRpc::new(
                        client.clone(),
                        workers.discovery.clone(),
                    )),
                    None,
                ),
            };
            let deps = SupervisorDeps {
                job_repo: memory.clone(),
                instance_repo: memory.clone(),
                task_repo: memory.clone(),
                id_generator: Arc::new(Snowflake::from_identity(&server.to_string())),
                discovery: workers.discovery.clone(),
                registry: supervisors.registry.clone(),
                transport: Arc::new(HttpTaskTransport::new(client.clone())),
                worker_rpc,
                locks: create_locks(&config, &server.to_string()).await?,
                local,
            };
            store = Some(memory);
            Some(SupervisorNode::new(server, deps, config.supervisor.clone()))
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let mut servers = Vec::new();
        let mut addresses = Vec::new();

        if let Some(node) = &supervisor_node {
            local_supervisor.set(node.rpc().clone());
        }
        if let Some(node) = &worker_node {
            node.start().await.context("启动Worker失败")?;
            let app = create_app(worker_routes(node.rpc().clone(), node.rpc().clone()));
            let (addr, handle) = spawn_server(&config.worker.bind_address, app, &cancel).await?;
            addresses.push(addr);
            servers.push(handle);
        }
        if let Some(node) = supervisor_node.as_mut() {
            if let Err(e) = node.start().await {
                if let Some(worker) = &worker_node {
                    worker.stop().await;
                }
                cancel.cancel();
                return Err(e).context("启动Supervisor失败");
            }
            let app = create_app(supervisor_routes(node.rpc().clone()));
            let (addr, handle) =
                spawn_server(&config.supervisor.bind_address, app, &cancel).await?;
            addresses.push(addr);
            servers.push(handle);
            seed_jobs(node, &config).await;
        }

        info!("应用程序已启动，HTTP监听: {:?}", addresses);
        Ok(RunningApp {
            mode,
            supervisor: supervisor_node,
            worker: worker_node,
            store,
            addresses,
            cancel,
            servers,
        })
    }
}

/// 注册配置文件中声明的任务，失败只记录日志
async fn seed_jobs(node: &SupervisorNode, config: &AppConfig) {
    for seed in &config.jobs {
        match node.manager().add_job(seed.to_job()).await {
            Ok(job_id) => info!("注册任务[{}]: {}", seed.job_name, job_id),
            Err(e) => warn!("注册任务[{}]失败: {}", seed.job_name, e),
        }
    }
}

/// 已启动的应用
pub struct RunningApp {
    mode: AppMode,
    supervisor: Option<SupervisorNode>,
    worker: Option<WorkerNode>,
    store: Option<Arc<MemoryStore>>,
    addresses: Vec<SocketAddr>,
    cancel: CancellationToken,
    servers: Vec<JoinHandle<()>>,
}

impl RunningApp {
    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn supervisor(&self) -> Option<&SupervisorNode> {
        self.supervisor.as_ref()
    }

    pub fn worker(&self) -> Option<&WorkerNode> {
        self.worker.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<MemoryStore>> {
        self.store.as_ref()
    }

    /// 实际监听的HTTP地址
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// 先停止扫描，再关闭Worker线程池(执行中的任务上报暂停)，最后关闭HTTP服务
    pub async fn stop(self) {
        info!("开始优雅关闭");
        if let Some(supervisor) = self.supervisor {
            supervisor.stop().await;
        }
        if let Some(worker) = &self.worker {
            worker.stop().await;
        }
        self.cancel.cancel();
        for handle in self.servers {
            if let Err(e) = handle.await {
                error!("HTTP服务退出异常: {}", e);
            }
        }
        info!("应用程序已关闭");
    }
}
