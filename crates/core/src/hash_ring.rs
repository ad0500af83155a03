//! 一致性哈希环
//!
//! 每个物理节点在环上放置若干虚拟节点，虚拟节点的键为`物理键 + "-NODE-" + 序号`。
//! 路由时取顺时针方向第一个哈希值不小于`hash(key)`的虚拟节点，没有则回到环首。
//!
//! 两个虚拟节点哈希冲突时后写入的覆盖先写入的，移除其中一个会连带丢失被覆盖的节点。

use std::collections::BTreeMap;
use std::fmt::Display;

use sha2::{Digest, Sha256};

/// 环使用的哈希函数，必须跨进程稳定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashFunction {
    /// FNV-1a 32位并做雪崩混合
    #[default]
    Fnv,
    /// 取SHA-256摘要的前16字节折叠为32位
    Sha256,
}

impl HashFunction {
    pub fn hash(&self, key: &str) -> u32 {
        match self {
            HashFunction::Fnv => fnv_hash(key),
            HashFunction::Sha256 => sha256_hash(key),
        }
    }
}

fn fnv_hash(key: &str) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut h: u32 = 2_166_136_261;
    for b in key.bytes() {
        h = (h ^ b as u32).wrapping_mul(PRIME);
    }
    h = h.wrapping_add(h << 13);
    h ^= h >> 7;
    h = h.wrapping_add(h << 3);
    h ^= h >> 17;
    h = h.wrapping_add(h << 5);
    h
}

fn sha256_hash(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    digest[..16]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0, |acc, h| acc ^ h)
}

#[derive(Debug, Clone)]
struct VirtualNode<T> {
    physical: T,
    physical_key: String,
}

#[derive(Debug, Clone)]
pub struct ConsistentHash<T> {
    ring: BTreeMap<u32, VirtualNode<T>>,
    hash_function: HashFunction,
}

impl<T: Clone + Display> ConsistentHash<T> {
    pub fn new(hash_function: HashFunction) -> Self {
        Self {
            ring: BTreeMap::new(),
            hash_function,
        }
    }

    pub fn with_nodes<'a, I>(nodes: I, virtual_count: usize, hash_function: HashFunction) -> Self
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut ring = Self::new(hash_function);
        for node in nodes {
            ring.add_node(node, virtual_count);
        }
        ring
    }

    /// 追加虚拟节点，序号从已有副本数开始
    pub fn add_node(&mut self, node: &T, virtual_count: usize) {
        let physical_key = node.to_string();
        let existing = self.existing_replicas(&physical_key);
        for i in 0..virtual_count {
            let virtual_key = format!("{}-NODE-{}", physical_key, existing + i);
            self.ring.insert(
                self.hash_function.hash(&virtual_key),
                VirtualNode {
                    physical: node.clone(),
                    physical_key: physical_key.clone(),
                },
            );
        }
    }

    pub fn remove_node(&mut self, node: &T) {
        let physical_key = node.to_string();
        self.ring.retain(|_, v| v.physical_key != physical_key);
    }

    pub fn route_node(&self, key: &str) -> Option<&T> {
        let hash = self.hash_function.hash(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, v)| &v.physical)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn virtual_size(&self) -> usize {
        self.ring.len()
    }

    fn existing_replicas(&self, physical_key: &str) -> usize {
        self.ring
            .values()
            .filter(|v| v.physical_key == physical_key)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{}:8080", i + 1)).collect()
    }

    #[test]
    fn test_hash_is_deterministic() {
        for f in [HashFunction::Fnv, HashFunction::Sha256] {
            assert_eq!(f.hash("job-1"), f.hash("job-1"));
            assert_ne!(f.hash("job-1"), f.hash("job-2"));
        }
    }

    #[test]
    fn test_empty_ring_routes_nothing() {
        let ring: ConsistentHash<String> = ConsistentHash::new(HashFunction::Fnv);
        assert!(ring.route_node("any").is_none());
    }

    #[test]
    fn test_single_node_takes_every_key() {
        let nodes = nodes(1);
        let ring = ConsistentHash::with_nodes(&nodes, 10, HashFunction::Fnv);
        for i in 0..100 {
            assert_eq!(ring.route_node(&i.to_string()), Some(&nodes[0]));
        }
    }

    #[test]
    fn test_remove_and_readd_restores_routing() {
        for f in [HashFunction::Fnv, HashFunction::Sha256] {
            let nodes = nodes(5);
            let mut ring = ConsistentHash::with_nodes(&nodes, 100, f);
            let before: Vec<String> = (0..2_000)
                .map(|i| ring.route_node(&format!("task-{i}")).unwrap().clone())
                .collect();

            ring.remove_node(&nodes[2]);
            ring.add_node(&nodes[2], 100);

            let after: Vec<String> = (0..2_000)
                .map(|i| ring.route_node(&format!("task-{i}")).unwrap().clone())
                .collect();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_add_node_bounded_churn() {
        let base = nodes(4);
        let mut ring = ConsistentHash::with_nodes(&base, 200, HashFunction::Sha256);
        let keys: Vec<String> = (0..20_000).map(|i| format!("task-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.route_node(k).unwrap().clone())
            .collect();

        let added = "10.0.0.99:8080".to_string();
        ring.add_node(&added, 200);

        let mut moved = 0;
        for (k, old) in keys.iter().zip(before.iter()) {
            let new = ring.route_node(k).unwrap();
            if new != old {
                // 只能迁移到新节点
                assert_eq!(new, &added);
                moved += 1;
            }
        }
        // 期望约1/5，留出统计波动空间
        let ratio = moved as f64 / keys.len() as f64;
        assert!(ratio > 0.08 && ratio < 0.32, "ratio = {ratio}");
    }

    #[test]
    fn test_add_node_appends_replicas() {
        let nodes = nodes(1);
        let mut ring = ConsistentHash::new(HashFunction::Fnv);
        ring.add_node(&nodes[0], 10);
        ring.add_node(&nodes[0], 5);
        assert_eq!(ring.virtual_size(), 15);
        ring.remove_node(&nodes[0]);
        assert!(ring.is_empty());
    }
}
