//! Consistent-hash ring with virtual nodes (C1).
//!
//! Every operation the rest of the system needs from the ring — primary
//! lookup, successor enumeration, membership changes — lives here and
//! nowhere else, mirroring how `aerolithdb-storage::sharding` isolates its
//! `ShardingEngine` from the rest of the storage crate. Positions are MD5
//! digests interpreted as 128-bit integers; the ring always re-hashes
//! whatever key it's given with MD5, even when the caller already hashed
//! it with SHA-1 for storage addressing — placement and addressing are
//! deliberately different hash spaces.

use md5::{Digest, Md5};
use tracing::debug;

fn md5_u128(input: &str) -> u128 {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    u128::from_be_bytes(digest.into())
}

#[derive(Debug, Clone)]
struct VirtualNode {
    position: u128,
    physical_node: String,
}

/// A consistent-hash ring over peer addresses.
///
/// Not internally synchronized: callers needing concurrent access wrap it
/// in their own lock (the membership layer does, since ring mutation and
/// peer-set mutation must be atomic together per I5).
#[derive(Debug, Clone, Default)]
pub struct ConsistentHashRing {
    replicas: usize,
    positions: Vec<VirtualNode>,
}

impl ConsistentHashRing {
    /// `replicas` is the number of virtual positions per physical node
    /// (spec default 100).
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas,
            positions: Vec::new(),
        }
    }

    /// Build a ring already populated with `nodes`.
    pub fn with_nodes<I: IntoIterator<Item = String>>(replicas: usize, nodes: I) -> Self {
        let mut ring = Self::new(replicas);
        for node in nodes {
            ring.add(&node);
        }
        ring
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn physical_node_count(&self) -> usize {
        let mut nodes: Vec<&str> = self.positions.iter().map(|v| v.physical_node.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    /// Insert `replicas` virtual positions for `node`, each at
    /// `MD5("node#i")`. Idempotent if called twice with the same node.
    pub fn add(&mut self, node: &str) {
        debug!(node, "adding node to ring");
        self.positions
            .retain(|v| v.physical_node != node);
        for i in 0..self.replicas {
            let position = md5_u128(&format!("{node}#{i}"));
            self.positions.push(VirtualNode {
                position,
                physical_node: node.to_string(),
            });
        }
        self.positions.sort_by_key(|v| v.position);
    }

    /// Remove every virtual position belonging to `node`.
    pub fn remove(&mut self, node: &str) {
        debug!(node, "removing node from ring");
        self.positions.retain(|v| v.physical_node != node);
    }

    /// The bisect point for `key`: index of the first position `>= hash(key)`,
    /// wrapping to 0 if `key` hashes past every position.
    fn bisect(&self, key: &str) -> usize {
        let hash = md5_u128(key);
        match self.positions.binary_search_by_key(&hash, |v| v.position) {
            Ok(idx) => idx,
            Err(idx) => {
                if idx >= self.positions.len() {
                    0
                } else {
                    idx
                }
            }
        }
    }

    /// The physical node responsible for `key`, or `None` if the ring is empty.
    pub fn get(&self, key: &str) -> Option<String> {
        if self.positions.is_empty() {
            return None;
        }
        let idx = self.bisect(key);
        Some(self.positions[idx].physical_node.clone())
    }

    /// Up to `count` distinct physical nodes, starting from the node
    /// responsible for `key` and scanning forward with wraparound.
    pub fn successors(&self, key: &str, count: usize) -> Vec<String> {
        if self.positions.is_empty() || count == 0 {
            return Vec::new();
        }
        let start = self.bisect(key);
        let total = self.positions.len();
        let max_attempts = total * 2;
        let mut out: Vec<String> = Vec::new();
        for step in 0..max_attempts {
            if out.len() >= count {
                break;
            }
            let idx = (start + step) % total;
            let node = &self.positions[idx].physical_node;
            if !out.contains(node) {
                out.push(node.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn empty_ring_returns_none() {
        let ring = ConsistentHashRing::new(100);
        assert_eq!(ring.get("x"), None);
        assert!(ring.successors("x", 3).is_empty());
    }

    #[test]
    fn get_is_deterministic() {
        let ring = ConsistentHashRing::with_nodes(100, ["a:1", "b:2", "c:3"].map(String::from));
        let first = ring.get("some-key");
        for _ in 0..10 {
            assert_eq!(ring.get("some-key"), first);
        }
    }

    #[test]
    fn successors_are_distinct_and_wrap() {
        let ring = ConsistentHashRing::with_nodes(50, ["a:1", "b:2", "c:3"].map(String::from));
        let succ = ring.successors("wrap-key", 5);
        // only 3 physical nodes exist, so 5 is capped at 3 distinct entries
        assert_eq!(succ.len(), 3);
        let mut sorted = succ.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn remove_drops_node_from_lookups() {
        let mut ring = ConsistentHashRing::with_nodes(100, ["a:1", "b:2"].map(String::from));
        ring.remove("a:1");
        assert_eq!(ring.physical_node_count(), 1);
        for _ in 0..50 {
            assert_eq!(ring.get("anything").as_deref(), Some("b:2"));
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut ring = ConsistentHashRing::new(100);
        ring.add("a:1");
        let count_once = ring.positions.len();
        ring.add("a:1");
        assert_eq!(ring.positions.len(), count_once);
    }

    proptest! {
        // P1: removing one node out of N should only reassign roughly a
        // 1/N fraction of keys, given enough virtual nodes per physical
        // node to smooth out variance.
        #[test]
        fn ring_removal_moves_bounded_fraction_of_keys(seed in 0u64..10_000) {
            let nodes: Vec<String> = (0..10).map(|i| format!("node-{i}:900{i}")).collect();
            let mut ring = ConsistentHashRing::with_nodes(150, nodes.clone());

            let keys: Vec<String> = (0..500).map(|i| format!("key-{seed}-{i}")).collect();
            let before: HashMap<String, String> = keys
                .iter()
                .map(|k| (k.clone(), ring.get(k).unwrap()))
                .collect();

            ring.remove(&nodes[0]);

            let moved = keys
                .iter()
                .filter(|k| ring.get(*k).as_ref() != Some(&before[*k]))
                .count();

            // Expected fraction ~= 1/10; allow generous slack for variance
            // with only 500 sample keys.
            prop_assert!((moved as f64) < (keys.len() as f64) * 0.35);
        }
    }
}
