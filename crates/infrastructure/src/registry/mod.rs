mod memory;
mod redis_registry;

pub use self::memory::MemoryRegistry;
pub use self::redis_registry::RedisRegistry;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scheduler_core::models::Server;

/// 发现结果的写时复制快照，读取不加锁等待
pub(crate) struct DiscoverySnapshot<S: Server> {
    current: RwLock<Arc<Snapshot<S>>>,
}

struct Snapshot<S> {
    all: Arc<Vec<S>>,
    groups: HashMap<String, Arc<Vec<S>>>,
}

impl<S: Server> DiscoverySnapshot<S> {
    pub(crate) fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot {
                all: Arc::new(Vec::new()),
                groups: HashMap::new(),
            })),
        }
    }

    /// 整体替换，服务器按字符串形式排序以保证各进程看到相同的顺序
    pub(crate) fn replace(&self, mut servers: Vec<S>) -> bool {
        servers.sort_by_key(|s| s.to_string());
        servers.dedup();
        let mut groups: HashMap<String, Vec<S>> = HashMap::new();
        for server in &servers {
            if let Some(group) = server.group() {
                groups
                    .entry(group.to_string())
                    .or_default()
                    .push(server.clone());
            }
        }
        let snapshot = Arc::new(Snapshot {
            all: Arc::new(servers),
            groups: groups
                .into_iter()
                .map(|(group, list)| (group, Arc::new(list)))
                .collect(),
        });
        match self.current.write() {
            Ok(mut current) => {
                let changed = current.all != snapshot.all;
                *current = snapshot;
                changed
            }
            Err(_) => false,
        }
    }

    pub(crate) fn servers(&self, group: Option<&str>) -> Arc<Vec<S>> {
        let snapshot = match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(_) => return Arc::new(Vec::new()),
        };
        match group {
            None => Arc::clone(&snapshot.all),
            Some(group) => snapshot
                .groups
                .get(group)
                .cloned()
                .unwrap_or_else(|| Arc::new(Vec::new())),
        }
    }
}
