//! Consistent-hash ring for queue partition placement.
//!
//! Each physical node owns 128 virtual points on a 64-bit ring, hashed with
//! xxhash64 (seed 0). The primary for a queue is the owner of the first
//! virtual point clockwise from the queue name's hash. Removing a node moves
//! only that node's share of queues; everything else stays put.
//!
//! Placement must be identical on every node: same roster in, same primary
//! out, regardless of insertion order.

use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Virtual points per physical node.
pub const VIRTUAL_NODES: usize = 128;

/// Compute xxhash64 of a key with seed 0.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// A consistent-hash ring over node ids.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring from a roster.
    pub fn from_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = Self::new();
        for node in nodes {
            ring.add_node(node.as_ref());
        }
        ring
    }

    /// Add a node's virtual points.
    pub fn add_node(&mut self, node: &str) {
        for i in 0..VIRTUAL_NODES {
            let point = hash_key(format!("{node}:{i}").as_bytes());
            self.ring.insert(point, node.to_string());
        }
    }

    /// Remove a node's virtual points.
    pub fn remove_node(&mut self, node: &str) {
        self.ring.retain(|_, owner| owner != node);
    }

    /// The node responsible for `key`: first virtual point clockwise from
    /// the key's hash, wrapping at the top of the ring.
    pub fn primary(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash_key(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Whether `node` is the primary for `key`.
    pub fn is_primary(&self, key: &str, node: &str) -> bool {
        self.primary(key) == Some(node)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Distinct nodes currently on the ring.
    pub fn node_count(&self) -> usize {
        let mut nodes: Vec<&str> = self.ring.values().map(|s| s.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }
}
