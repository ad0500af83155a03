use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    config::RegistryConfig,
    models::{now_millis, Server},
    traits::{Discovery, Registry},
    SchedulerError, SchedulerResult,
};

use super::DiscoverySnapshot;

/// 基于Redis有序集合的注册中心
///
/// 每个角色一个有序集合，成员为服务器的字符串形式，分数为过期时间。
/// 后台循环周期性续期本进程注册的服务器、清理过期成员并刷新发现快照。
pub struct RedisRegistry<S: Server> {
    conn: ConnectionManager,
    key: String,
    session_timeout_ms: i64,
    refresh_period: Duration,
    registered: Mutex<HashSet<S>>,
    snapshot: DiscoverySnapshot<S>,
    connected: AtomicBool,
    cancel: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Server> RedisRegistry<S> {
    pub async fn connect(url: &str, config: &RegistryConfig) -> SchedulerResult<Arc<Self>> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        let key = format!("{}:registry:{}", config.namespace, S::role());
        info!("连接Redis注册中心: {}", key);

        let registry = Arc::new(Self {
            conn,
            key,
            session_timeout_ms: config.session_timeout_ms as i64,
            refresh_period: Duration::from_millis(config.refresh_period_ms.max(1)),
            registered: Mutex::new(HashSet::new()),
            snapshot: DiscoverySnapshot::new(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            refresher: Mutex::new(None),
        });
        registry.refresh().await?;
        registry.start();
        Ok(registry)
    }

    fn start(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let token = self.cancel.clone();
        let period = self.refresh_period;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.heartbeat().await;
                    }
                }
            }
            debug!("注册中心刷新循环已停止");
        });
        if let Ok(mut refresher) = self.refresher.lock() {
            *refresher = Some(handle);
        }
    }

    fn registered_servers(&self) -> Vec<S> {
        self.registered
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn heartbeat(&self) {
        let result: SchedulerResult<()> = async {
            for server in self.registered_servers() {
                self.renew(&server).await?;
            }
            self.refresh().await
        }
        .await;
        match result {
            Ok(()) => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    self.on_connected().await;
                }
            }
            Err(e) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    self.on_disconnected(&e);
                } else {
                    debug!("注册中心仍不可用: {}", e);
                }
            }
        }
    }

    /// 重连后重新注册并刷新
    async fn on_connected(&self) {
        info!("注册中心连接恢复: {}", self.key);
        for server in self.registered_servers() {
            if let Err(e) = self.renew(&server).await {
                warn!("重新注册失败 {}: {}", server, e);
            }
        }
        if let Err(e) = self.refresh().await {
            warn!("刷新发现列表失败: {}", e);
        }
    }

    fn on_disconnected(&self, err: &SchedulerError) {
        error!("注册中心连接断开 {}: {}", self.key, err);
    }

    async fn renew(&self, server: &S) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        let expire_at = now_millis() + self.session_timeout_ms;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(expire_at)
            .arg(server.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// 清理过期成员并替换发现快照
    pub async fn refresh(&self) -> SchedulerResult<()> {
        let mut conn = self.conn.clone();
        let now = now_millis();
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&self.key)
            .arg("-inf")
            .arg(now)
            .query_async(&mut conn)
            .await?;
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.key)
            .arg(now)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        let mut servers = Vec::with_capacity(members.len());
        for member in members {
            match member.parse::<S>() {
                Ok(server) => servers.push(server),
                Err(e) => warn!("无法解析注册的服务器 {}: {}", member, e),
            }
        }
        if self.snapshot.replace(servers) {
            info!(
                "{}列表变化: {:?}",
                S::role(),
                self.snapshot
                    .servers(None)
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Server> Registry<S> for RedisRegistry<S> {
    async fn register(&self, server: &S) -> SchedulerResult<()> {
        info!("注册{}: {}", S::role(), server);
        self.renew(server).await?;
        if let Ok(mut registered) = self.registered.lock() {
            registered.insert(server.clone());
        }
        self.refresh().await
    }

    async fn deregister(&self, server: &S) -> SchedulerResult<()> {
        info!("注销{}: {}", S::role(), server);
        if let Ok(mut registered) = self.registered.lock() {
            registered.remove(server);
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(&self.key)
            .arg(server.to_string())
            .query_async(&mut conn)
            .await?;
        self.refresh().await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.refresher.lock().ok().and_then(|mut r| r.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("注册中心刷新循环退出异常: {}", e);
            }
        }
        for server in self.registered_servers() {
            if let Err(e) = self.deregister(&server).await {
                warn!("关闭时注销失败 {}: {}", server, e);
            }
        }
    }
}

impl<S: Server> Discovery<S> for RedisRegistry<S> {
    fn discovered_servers(&self, group: Option<&str>) -> Arc<Vec<S>> {
        self.snapshot.servers(group)
    }
}
