use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use scheduler_core::{
    hash_ring::{ConsistentHash, HashFunction},
    models::{RouteStrategy, Worker},
    SchedulerError, SchedulerResult,
};

/// 从分组内存活的Worker中为一个分片选择执行者
pub trait WorkerSelector: Send + Sync {
    fn select(&self, group: &str, task_id: i64, workers: &[Worker]) -> Option<Worker>;

    fn name(&self) -> &str;
}

/// 按分组轮询
#[derive(Default)]
pub struct RoundRobinStrategy {
    counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, group: &str, len: usize) -> usize {
        let counter = match self.counters.lock() {
            Ok(mut counters) => counters
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone(),
            Err(_) => return 0,
        };
        counter.fetch_add(1, Ordering::Relaxed) % len
    }
}

impl WorkerSelector for RoundRobinStrategy {
    fn select(&self, group: &str, _task_id: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let index = self.next_index(group, workers.len());
        let selected = &workers[index];
        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            selected,
            index,
            workers.len()
        );
        Some(selected.clone())
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

#[derive(Default)]
pub struct RandomStrategy;

impl WorkerSelector for RandomStrategy {
    fn select(&self, _group: &str, _task_id: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..workers.len());
        Some(workers[index].clone())
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// 分片ID取哈希后对Worker数取模
#[derive(Default)]
pub struct SimpleHashStrategy;

impl WorkerSelector for SimpleHashStrategy {
    fn select(&self, _group: &str, task_id: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let hash = HashFunction::Fnv.hash(&task_id.to_string()) as usize;
        Some(workers[hash % workers.len()].clone())
    }

    fn name(&self) -> &str {
        "SimpleHash"
    }
}

struct GroupRing {
    members: Vec<Worker>,
    ring: ConsistentHash<Worker>,
}

/// 每个分组维护一个哈希环，成员变化时增量调整
pub struct ConsistentHashStrategy {
    virtual_count: usize,
    hash_function: HashFunction,
    rings: Mutex<HashMap<String, GroupRing>>,
}

impl ConsistentHashStrategy {
    pub fn new(virtual_count: usize, hash_function: HashFunction) -> Self {
        Self {
            virtual_count: virtual_count.max(1),
            hash_function,
            rings: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ConsistentHashStrategy {
    fn default() -> Self {
        Self::new(100, HashFunction::Sha256)
    }
}

impl WorkerSelector for ConsistentHashStrategy {
    fn select(&self, group: &str, task_id: i64, workers: &[Worker]) -> Option<Worker> {
        if workers.is_empty() {
            return None;
        }
        let mut rings = self.rings.lock().ok()?;
        let entry = rings
            .entry(group.to_string())
            .or_insert_with(|| GroupRing {
                members: Vec::new(),
                ring: ConsistentHash::new(self.hash_function),
            });

        let removed: Vec<Worker> = entry
            .members
            .iter()
            .filter(|w| !workers.contains(w))
            .cloned()
            .collect();
        for worker in &removed {
            entry.ring.remove_node(worker);
        }
        entry.members.retain(|w| !removed.contains(w));
        for worker in workers {
            if !entry.members.contains(worker) {
                entry.ring.add_node(worker, self.virtual_count);
                entry.members.push(worker.clone());
            }
        }

        entry.ring.route_node(&task_id.to_string()).cloned()
    }

    fn name(&self) -> &str {
        "ConsistentHash"
    }
}

/// 优先使用本进程内嵌的Worker，否则退化为轮询
pub struct LocalPriorityStrategy {
    local: Option<Worker>,
    fallback: RoundRobinStrategy,
}

impl LocalPriorityStrategy {
    pub fn new(local: Option<Worker>) -> Self {
        Self {
            local,
            fallback: RoundRobinStrategy::new(),
        }
    }
}

impl WorkerSelector for LocalPriorityStrategy {
    fn select(&self, group: &str, task_id: i64, workers: &[Worker]) -> Option<Worker> {
        if let Some(local) = self.local.as_ref().filter(|l| workers.contains(l)) {
            return Some(local.clone());
        }
        self.fallback.select(group, task_id, workers)
    }

    fn name(&self) -> &str {
        "LocalPriority"
    }
}

/// 路由策略到选择器的分发表
pub struct WorkerRouter {
    round_robin: RoundRobinStrategy,
    random: RandomStrategy,
    simple_hash: SimpleHashStrategy,
    consistent_hash: ConsistentHashStrategy,
    local_priority: LocalPriorityStrategy,
}

impl WorkerRouter {
    pub fn new(local: Option<Worker>, virtual_count: usize) -> Self {
        Self {
            round_robin: RoundRobinStrategy::new(),
            random: RandomStrategy,
            simple_hash: SimpleHashStrategy,
            consistent_hash: ConsistentHashStrategy::new(virtual_count, HashFunction::Sha256),
            local_priority: LocalPriorityStrategy::new(local),
        }
    }

    fn selector(&self, strategy: RouteStrategy) -> SchedulerResult<&dyn WorkerSelector> {
        Ok(match strategy {
            RouteStrategy::RoundRobin => &self.round_robin,
            RouteStrategy::Random => &self.random,
            RouteStrategy::SimpleHash => &self.simple_hash,
            RouteStrategy::ConsistentHash => &self.consistent_hash,
            RouteStrategy::LocalPriority => &self.local_priority,
            RouteStrategy::Broadcast => {
                return Err(SchedulerError::Unsupported(
                    "广播任务在拆分时已指定Worker".to_string(),
                ))
            }
        })
    }

    /// 没有存活Worker时返回`NoAvailableWorker`
    pub fn route(
        &self,
        strategy: RouteStrategy,
        group: &str,
        task_id: i64,
        workers: &[Worker],
    ) -> SchedulerResult<Worker> {
        let selector = self.selector(strategy)?;
        selector
            .select(group, task_id, workers)
            .ok_or_else(|| SchedulerError::NoAvailableWorker {
                group: group.to_string(),
            })
    }
}
