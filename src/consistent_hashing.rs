//! Consistent hash ring with virtual nodes
//!
//! Every physical node owns `virtual_nodes` positions on a `u64` ring.
//! A key belongs to the node owning the first position at or after the
//! key's hash, wrapping around past the largest position. Adding or removing
//! one node only moves the keys that land on that node's positions.
use std::collections::BTreeSet;
use std::sync::Arc;

use xxhash_rust::xxh64::xxh64;

use crate::error::{Result, WrenError};
use crate::settings::DEFAULT_VIRTUAL_NODES;

/// Stable 64-bit hash used for both keys and virtual node positions
pub fn hash_key(key: &str) -> u64 {
    xxh64(key.as_bytes(), 0)
}

fn virtual_position(node: &str, replica: usize) -> u64 {
    hash_key(&format!("{}#{}", node, replica))
}

#[derive(Clone, Debug)]
pub struct HashRing {
    virtual_nodes: usize,
    // Strictly sorted by position
    ring: Vec<(u64, Arc<str>)>,
    nodes: BTreeSet<Arc<str>>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: Vec::new(),
            nodes: BTreeSet::new(),
        }
    }

    pub fn with_nodes<I, S>(virtual_nodes: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new(virtual_nodes);
        ring.nodes = nodes.into_iter().map(|n| Arc::from(n.as_ref())).collect();
        ring.rebuild();
        ring
    }

    /// Register `node`. Returns false if it was already present.
    pub fn add_node(&mut self, node: &str) -> bool {
        if self.nodes.contains(node) {
            return false;
        }
        self.nodes.insert(Arc::from(node));
        self.rebuild();
        true
    }

    /// Drop `node` and all of its positions. Returns false if unknown.
    pub fn remove_node(&mut self, node: &str) -> bool {
        if !self.nodes.remove(node) {
            return false;
        }
        self.rebuild();
        true
    }

    /// Recompute every position and swap the new ring in whole.
    ///
    /// Positions that collide keep the lexicographically smallest node, so
    /// the ring depends only on the node set, never on insertion order.
    fn rebuild(&mut self) {
        let mut ring: Vec<(u64, Arc<str>)> =
            Vec::with_capacity(self.nodes.len() * self.virtual_nodes);
        for node in &self.nodes {
            for replica in 0..self.virtual_nodes {
                ring.push((virtual_position(node, replica), node.clone()));
            }
        }
        ring.sort_unstable();
        ring.dedup_by_key(|(position, _)| *position);
        self.ring = ring;
    }

    /// Index of the first position >= `hash`, wrapping to 0
    fn successor(&self, hash: u64) -> usize {
        let idx = self.ring.partition_point(|(position, _)| *position < hash);
        if idx == self.ring.len() {
            0
        } else {
            idx
        }
    }

    /// The node that owns `key`
    pub fn lookup(&self, key: &str) -> Result<&str> {
        if self.ring.is_empty() {
            return Err(WrenError::EmptyRing);
        }
        let idx = self.successor(hash_key(key));
        Ok(self.ring[idx].1.as_ref())
    }

    /// Up to `n` distinct nodes for `key`, owner first, in ring order.
    ///
    /// Used for replication fan-out. Returns fewer than `n` nodes when the
    /// ring holds fewer.
    pub fn lookup_n(&self, key: &str, n: usize) -> Result<Vec<String>> {
        if self.ring.is_empty() {
            return Err(WrenError::EmptyRing);
        }
        let wanted = n.min(self.nodes.len());
        let mut found: Vec<String> = Vec::with_capacity(wanted);
        let start = self.successor(hash_key(key));
        for offset in 0..self.ring.len() {
            if found.len() == wanted {
                break;
            }
            let node = &self.ring[(start + offset) % self.ring.len()].1;
            if !found.iter().any(|f| f.as_str() == node.as_ref()) {
                found.push(node.to_string());
            }
        }
        Ok(found)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.to_string()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of positions on the ring
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}
