use std::sync::Arc;

use async_trait::async_trait;

use crate::{models::Server, SchedulerResult};

/// 服务注册
#[async_trait]
pub trait Registry<S: Server>: Send + Sync {
    async fn register(&self, server: &S) -> SchedulerResult<()>;

    async fn deregister(&self, server: &S) -> SchedulerResult<()>;

    async fn close(&self) {}
}

/// 服务发现，读取的是最终一致的快照
pub trait Discovery<S: Server>: Send + Sync {
    /// `group`为None时返回全部
    fn discovered_servers(&self, group: Option<&str>) -> Arc<Vec<S>>;

    fn is_discovered_server(&self, server: &S) -> bool {
        self.discovered_servers(server.group())
            .iter()
            .any(|s| s == server)
    }

    fn has_discovered_servers(&self) -> bool {
        !self.discovered_servers(None).is_empty()
    }

    fn has_discovered_group(&self, group: &str) -> bool {
        !self.discovered_servers(Some(group)).is_empty()
    }
}
