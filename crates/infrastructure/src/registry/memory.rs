use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use scheduler_core::{
    models::Server,
    traits::{Discovery, Registry},
    SchedulerError, SchedulerResult,
};

use super::DiscoverySnapshot;

/// 进程内注册中心，单进程部署和测试使用
pub struct MemoryRegistry<S: Server> {
    servers: Mutex<Vec<S>>,
    snapshot: DiscoverySnapshot<S>,
}

impl<S: Server> Default for MemoryRegistry<S> {
    fn default() -> Self {
        Self {
            servers: Mutex::new(Vec::new()),
            snapshot: DiscoverySnapshot::new(),
        }
    }
}

impl<S: Server> MemoryRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, f: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut Vec<S>),
    {
        let mut servers = self
            .servers
            .lock()
            .map_err(|e| SchedulerError::Internal(format!("注册表锁异常: {e}")))?;
        f(&mut servers);
        self.snapshot.replace(servers.clone());
        Ok(())
    }
}

#[async_trait]
impl<S: Server> Registry<S> for MemoryRegistry<S> {
    async fn register(&self, server: &S) -> SchedulerResult<()> {
        info!("注册{}: {}", S::role(), server);
        self.update(|servers| {
            if !servers.contains(server) {
                servers.push(server.clone());
            }
        })
    }

    async fn deregister(&self, server: &S) -> SchedulerResult<()> {
        info!("注销{}: {}", S::role(), server);
        self.update(|servers| servers.retain(|s| s != server))
    }
}

impl<S: Server> Discovery<S> for MemoryRegistry<S> {
    fn discovered_servers(&self, group: Option<&str>) -> std::sync::Arc<Vec<S>> {
        self.snapshot.servers(group)
    }
}
