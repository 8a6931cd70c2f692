//! Consistent Hash Ring
//!
//! Weighted ring of virtual nodes. Every node is placed `replicas * weight / 100`
//! times; a key belongs to the first virtual node clockwise from its hash.
//!
//! `lookup` hands back the node value itself, so the ring can hold any shard
//! type without runtime downcasting.

use std::fmt::Display;

/// Virtual nodes for a node of full weight
pub const DEFAULT_REPLICAS: usize = 100;

/// Weight that maps to the full replica count
pub const TOP_WEIGHT: u32 = 100;

/// Consistent hash dispatcher
#[derive(Debug, Clone)]
pub struct ConsistentHash<N> {
    replicas: usize,
    /// Sorted (hash, node index)
    ring: Vec<(u64, usize)>,
    nodes: Vec<N>,
}

impl<N> Default for ConsistentHash<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> ConsistentHash<N> {
    /// Create an empty ring with the default replica count
    pub fn new() -> Self {
        Self::with_replicas(DEFAULT_REPLICAS)
    }

    /// Create an empty ring with `replicas` virtual nodes per full-weight node
    pub fn with_replicas(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the ring has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, in insertion order
    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    /// Number of virtual nodes on the ring
    pub fn virtual_nodes(&self) -> usize {
        self.ring.len()
    }
}

impl<N: Display> ConsistentHash<N> {
    /// Add a node at full weight
    pub fn add(&mut self, node: N) {
        self.add_with_weight(node, TOP_WEIGHT);
    }

    /// Add a node owning a share of the ring proportional to `weight` (1-100)
    pub fn add_with_weight(&mut self, node: N, weight: u32) {
        let weight = weight.clamp(1, TOP_WEIGHT) as usize;
        let replicas = (self.replicas * weight / TOP_WEIGHT as usize).max(1);

        let index = self.nodes.len();
        let label = node.to_string();
        for i in 0..replicas {
            let hash = hash_bytes(format!("{}{}", label, i).as_bytes());
            self.ring.push((hash, index));
        }
        self.ring.sort_unstable();
        self.nodes.push(node);
    }

    /// Find the node owning `key`
    pub fn lookup(&self, key: &str) -> Option<&N> {
        if self.ring.is_empty() {
            return None;
        }

        let hash = hash_bytes(key.as_bytes());
        let idx = self.ring.partition_point(|(h, _)| *h < hash);
        let (_, node) = self.ring[idx % self.ring.len()];
        self.nodes.get(node)
    }
}

/// FxHash followed by a 64-bit finalizer so short, similar labels spread out
fn hash_bytes(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^ (hash >> 33)
}

// =============================================================================
// Tests
// =============================================================================
