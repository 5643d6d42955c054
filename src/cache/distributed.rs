//! Cache sharded across nodes with a consistent hash ring
//!
//! Each node is an independent [`Cache`] with its own lock. Every operation
//! looks up the owning node on the ring and touches only that node. When a
//! node joins, keys it takes over are dropped from their previous shards and
//! are misses until refilled; when a node leaves, its entries go with it.
//! A shard therefore only ever holds keys it owns, so a later removal cannot
//! route reads back to a copy that was overwritten or deleted elsewhere.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{self, SharedClock};
use crate::config_error;
use crate::consistent_hashing::HashRing;
use crate::error::Result;
use crate::settings::DEFAULT_VIRTUAL_NODES;
use crate::validation_error;

use super::{new_cache, Cache, CachePolicy};

/// Entry count of one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub node: String,
    pub entries: usize,
    pub capacity: usize,
}

struct Topology<V> {
    ring: HashRing,
    shards: HashMap<String, Arc<dyn Cache<V>>>,
}

pub struct DistributedCache<V> {
    topology: RwLock<Topology<V>>,
    policy: CachePolicy,
    capacity_per_node: usize,
    clock: SharedClock,
}

impl<V: Clone + Send + Sync + 'static> DistributedCache<V> {
    /// `node_count` nodes named `node-0`, `node-1`, ...
    pub fn new(node_count: usize, policy: CachePolicy, capacity_per_node: usize) -> Result<Self> {
        Self::with_options(
            node_count,
            policy,
            capacity_per_node,
            DEFAULT_VIRTUAL_NODES,
            clock::system_clock(),
        )
    }

    pub fn with_options(
        node_count: usize,
        policy: CachePolicy,
        capacity_per_node: usize,
        virtual_nodes: usize,
        clock: SharedClock,
    ) -> Result<Self> {
        if node_count == 0 {
            return Err(config_error!("distributed cache needs at least one node"));
        }
        let cache = Self {
            topology: RwLock::new(Topology {
                ring: HashRing::new(virtual_nodes),
                shards: HashMap::with_capacity(node_count),
            }),
            policy,
            capacity_per_node,
            clock,
        };
        for i in 0..node_count {
            cache.add_node(&format!("node-{}", i))?;
        }
        Ok(cache)
    }

    /// The node owning `key`
    pub fn node_for(&self, key: &str) -> Result<String> {
        self.topology.read().ring.lookup(key).map(str::to_string)
    }

    fn shard_for(&self, key: &str) -> Result<Arc<dyn Cache<V>>> {
        let topology = self.topology.read();
        let node = topology.ring.lookup(key)?;
        topology
            .shards
            .get(node)
            .cloned()
            .ok_or_else(|| validation_error!("node {} has no shard", node))
    }

    /// Add an empty node. Returns false if it already exists.
    ///
    /// Keys the new node takes over are deleted from the shards that held
    /// them.
    pub fn add_node(&self, node: &str) -> Result<bool> {
        let shard = new_cache(self.policy, self.capacity_per_node, self.clock.clone())?;
        let mut topology = self.topology.write();
        if !topology.ring.add_node(node) {
            return Ok(false);
        }
        let mut moved = 0;
        for previous in topology.shards.values() {
            for key in previous.keys() {
                if topology.ring.lookup(&key)? == node && previous.delete(&key) {
                    moved += 1;
                }
            }
        }
        topology.shards.insert(node.to_string(), shard);
        info!(
            "[distributed-cache] Added node {}, dropping {} relocated entries",
            node, moved
        );
        Ok(true)
    }

    /// Remove a node and drop its entries. The last node cannot be removed.
    pub fn remove_node(&self, node: &str) -> Result<bool> {
        let mut topology = self.topology.write();
        if !topology.ring.contains_node(node) {
            return Ok(false);
        }
        if topology.ring.node_count() == 1 {
            return Err(validation_error!("cannot remove the last cache node {}", node));
        }
        topology.ring.remove_node(node);
        let dropped = topology
            .shards
            .remove(node)
            .map(|shard| shard.len())
            .unwrap_or(0);
        info!(
            "[distributed-cache] Removed node {}, dropping {} entries",
            node, dropped
        );
        Ok(true)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.topology.read().ring.nodes()
    }

    /// Per-node entry counts, sorted by node name
    pub fn shard_stats(&self) -> Vec<ShardStats> {
        let topology = self.topology.read();
        let mut stats: Vec<ShardStats> = topology
            .shards
            .iter()
            .map(|(node, shard)| ShardStats {
                node: node.clone(),
                entries: shard.len(),
                capacity: shard.capacity(),
            })
            .collect();
        stats.sort_by(|a, b| a.node.cmp(&b.node));
        stats
    }

    fn shards(&self) -> Vec<Arc<dyn Cache<V>>> {
        self.topology.read().shards.values().cloned().collect()
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> for DistributedCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        match self.shard_for(key) {
            Ok(shard) => shard.get(key),
            Err(err) => {
                warn!("[distributed-cache] get {}: {}", key, err);
                None
            }
        }
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        match self.shard_for(key) {
            Ok(shard) => shard.set(key, value, ttl),
            Err(err) => warn!("[distributed-cache] set {} dropped: {}", key, err),
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.shard_for(key)
            .map(|shard| shard.delete(key))
            .unwrap_or(false)
    }

    fn clear(&self) {
        for shard in self.shards() {
            shard.clear();
        }
    }

    fn len(&self) -> usize {
        self.shards().iter().map(|shard| shard.len()).sum()
    }

    fn capacity(&self) -> usize {
        self.shards().iter().map(|shard| shard.capacity()).sum()
    }

    fn keys(&self) -> Vec<String> {
        self.shards().iter().flat_map(|shard| shard.keys()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn sharded(nodes: usize) -> DistributedCache<usize> {
        DistributedCache::with_options(nodes, CachePolicy::Lru, 1_000, 64, ManualClock::new(0))
            .unwrap()
    }

    #[test]
    fn keys_land_on_their_owning_node() {
        let cache = sharded(3);
        for i in 0..300 {
            cache.set(&format!("key_{}", i), i, None);
        }
        assert_eq!(cache.len(), 300);
        let topology = cache.topology.read();
        for i in 0..300 {
            let key = format!("key_{}", i);
            let owner = topology.ring.lookup(&key).unwrap();
            for (node, shard) in &topology.shards {
                assert_eq!(shard.get(&key).is_some(), node == owner);
            }
        }
    }

    #[test]
    fn every_node_gets_some_keys() {
        let cache = sharded(4);
        for i in 0..1_000 {
            cache.set(&format!("key_{}", i), i, None);
        }
        let stats = cache.shard_stats();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[0].node, "node-0");
        assert!(stats.iter().all(|s| s.entries > 100));
        assert_eq!(cache.capacity(), 4_000);
    }

    #[test]
    fn delete_and_clear_route_through_the_ring() {
        let cache = sharded(3);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("b"), Some(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn removing_a_node_drops_only_its_keys() {
        let cache = sharded(3);
        for i in 0..300 {
            cache.set(&format!("key_{}", i), i, None);
        }
        let owners: Vec<String> = (0..300)
            .map(|i| cache.node_for(&format!("key_{}", i)).unwrap())
            .collect();

        assert_eq!(cache.remove_node("node-1"), Ok(true));
        assert_eq!(cache.remove_node("node-1"), Ok(false));
        assert_eq!(cache.nodes(), vec!["node-0".to_string(), "node-2".to_string()]);
        for (i, owner) in owners.iter().enumerate() {
            let hit = cache.get(&format!("key_{}", i)).is_some();
            assert_eq!(hit, owner != "node-1", "key_{}", i);
        }
    }

    #[test]
    fn adding_a_node_only_moves_keys_to_it() {
        let cache = sharded(3);
        let keys: Vec<String> = (0..500).map(|i| format!("key_{}", i)).collect();
        let before: Vec<String> = keys.iter().map(|k| cache.node_for(k).unwrap()).collect();
        assert_eq!(cache.add_node("node-3"), Ok(true));
        assert_eq!(cache.add_node("node-3"), Ok(false));
        for (key, old_owner) in keys.iter().zip(&before) {
            let new_owner = cache.node_for(key).unwrap();
            assert!(new_owner == *old_owner || new_owner == "node-3");
        }
    }

    #[test]
    fn relocated_keys_leave_their_old_shard() {
        let cache = sharded(3);
        for i in 0..500 {
            cache.set(&format!("key_{}", i), i, None);
        }
        cache.add_node("node-3").unwrap();
        let topology = cache.topology.read();
        for (node, shard) in &topology.shards {
            for key in shard.keys() {
                assert_eq!(topology.ring.lookup(&key).unwrap(), node);
            }
        }
        let moved = (0..500)
            .filter(|i| topology.ring.lookup(&format!("key_{}", i)).unwrap() == "node-3")
            .count();
        drop(topology);
        assert!(moved > 0);
        assert_eq!(cache.len(), 500 - moved);
        assert_eq!(cache.keys().len(), 500 - moved);
    }

    #[test]
    fn last_node_stays() {
        let cache = sharded(1);
        assert!(cache.remove_node("node-0").is_err());
        assert!(DistributedCache::<u32>::new(0, CachePolicy::Lfu, 10).is_err());
    }
}
