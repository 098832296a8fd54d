//! MESI-coherent cache directory with LRU eviction.
//!
//! Each node keeps its own directory of lines; coherence comes from the
//! replicated `CachePut`/`CacheEvict` commands (origin ends in M, everyone
//! else in I) and from read probes answered peer-to-peer (M/E holders
//! downgrade to S when they supply a value).
//!
//! The cluster invariant per key: at most one node in M or E; if any node is
//! in M, every other node is in I. An absent line reads as I.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// MESI line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

#[derive(Debug, Clone)]
struct CacheLine {
    value: Bytes,
    state: MesiState,
    /// Logical use counter for LRU ordering; no wall clock in the apply path.
    last_used: u64,
}

/// A line that must leave the cache to restore capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub key: String,
    /// Present when the evicted line was Modified: the value that must be
    /// written back (via a replicated CacheEvict) before the line is lost.
    pub writeback: Option<Bytes>,
}

/// What a peer answers to a read probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReply {
    pub value: Bytes,
    /// The responder's state after answering (always Shared).
    pub state: MesiState,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// One node's cache directory.
pub struct CacheDirectory {
    node_id: String,
    capacity: usize,
    lines: HashMap<String, CacheLine>,
    use_counter: u64,
    stats: CacheStats,
}

impl CacheDirectory {
    pub fn new(node_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            node_id: node_id.into(),
            capacity: capacity.max(1),
            lines: HashMap::new(),
            use_counter: 0,
            stats: CacheStats::default(),
        }
    }

    fn touch(&mut self, key: &str) {
        self.use_counter += 1;
        let counter = self.use_counter;
        if let Some(line) = self.lines.get_mut(key) {
            line.last_used = counter;
        }
    }

    /// Local read. Hits M/E/S; everything else is a miss.
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        match self.lines.get(key) {
            Some(line) if line.state != MesiState::Invalid => {
                let value = line.value.clone();
                self.touch(key);
                self.stats.hits += 1;
                Some(value)
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Observed state for a key; absent reads as Invalid.
    pub fn state(&self, key: &str) -> MesiState {
        self.lines
            .get(key)
            .map(|l| l.state)
            .unwrap_or(MesiState::Invalid)
    }

    /// Answer a peer's read probe. An M or E holder downgrades itself to S
    /// and supplies the value; an S holder supplies the value unchanged.
    pub fn handle_probe(&mut self, key: &str) -> Option<ProbeReply> {
        let line = self.lines.get_mut(key)?;
        match line.state {
            MesiState::Modified | MesiState::Exclusive | MesiState::Shared => {
                line.state = MesiState::Shared;
                Some(ProbeReply {
                    value: line.value.clone(),
                    state: MesiState::Shared,
                })
            }
            MesiState::Invalid => None,
        }
    }

    /// Install a line in Shared state after a successful peer probe.
    pub fn fill_shared(&mut self, key: &str, value: Bytes) -> Vec<Eviction> {
        self.install(key, value, MesiState::Shared)
    }

    /// Install a line in Exclusive state after a miss served by the backing
    /// store with no other holder.
    pub fn fill_exclusive(&mut self, key: &str, value: Bytes) -> Vec<Eviction> {
        self.install(key, value, MesiState::Exclusive)
    }

    fn install(&mut self, key: &str, value: Bytes, state: MesiState) -> Vec<Eviction> {
        self.use_counter += 1;
        self.lines.insert(
            key.to_string(),
            CacheLine {
                value,
                state,
                last_used: self.use_counter,
            },
        );
        self.enforce_capacity(Some(key))
    }

    /// Apply a committed `CachePut`: the origin holds the only valid copy in
    /// M; every other node drops to I.
    pub fn apply_put(&mut self, key: &str, value: Bytes, origin: &str) -> Vec<Eviction> {
        if self.node_id == origin {
            self.install(key, value, MesiState::Modified)
        } else {
            self.lines.remove(key);
            Vec::new()
        }
    }

    /// Apply a committed `CacheInvalidate`: everyone but the origin drops
    /// the line.
    pub fn apply_invalidate(&mut self, key: &str, origin: &str) {
        if self.node_id != origin {
            self.lines.remove(key);
        }
    }

    /// Apply a committed `CacheEvict`: the origin's line is gone.
    pub fn apply_evict(&mut self, key: &str, origin: &str) {
        if self.node_id == origin {
            self.lines.remove(key);
        }
    }

    /// Best-effort invalidation hint from a peer broadcast. Dropping a clean
    /// line is always safe; a Modified line must survive until its value is
    /// written back, so the hint never touches it.
    pub fn drop_if_clean(&mut self, key: &str) {
        if let Some(line) = self.lines.get(key) {
            if line.state != MesiState::Modified {
                self.lines.remove(key);
            }
        }
    }

    /// Evict LRU lines until within capacity. Modified lines surface their
    /// value for write-back; S/E/I lines leave silently.
    fn enforce_capacity(&mut self, keep: Option<&str>) -> Vec<Eviction> {
        let mut evictions = Vec::new();
        while self.lines.len() > self.capacity {
            let victim = self
                .lines
                .iter()
                .filter(|(k, _)| Some(k.as_str()) != keep)
                .min_by_key(|(_, line)| line.last_used)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else { break };
            if let Some(line) = self.lines.remove(&key) {
                self.stats.evictions += 1;
                evictions.push(Eviction {
                    key,
                    writeback: (line.state == MesiState::Modified).then(|| line.value),
                });
            }
        }
        evictions
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(capacity: usize) -> CacheDirectory {
        CacheDirectory::new("n1", capacity)
    }

    #[test]
    fn put_origin_is_modified_others_invalid() {
        let mut a = CacheDirectory::new("a", 10);
        let mut b = CacheDirectory::new("b", 10);

        // Both start shared.
        a.fill_shared("k", Bytes::from("1"));
        b.fill_shared("k", Bytes::from("1"));

        a.apply_put("k", Bytes::from("2"), "a");
        b.apply_put("k", Bytes::from("2"), "a");

        assert_eq!(a.state("k"), MesiState::Modified);
        assert_eq!(b.state("k"), MesiState::Invalid);
        assert_eq!(a.get("k"), Some(Bytes::from("2")));
        assert_eq!(b.get("k"), None);
    }

    #[test]
    fn probe_downgrades_modified_to_shared() {
        let mut d = dir(10);
        d.apply_put("k", Bytes::from("v"), "n1");
        assert_eq!(d.state("k"), MesiState::Modified);

        let reply = d.handle_probe("k").unwrap();
        assert_eq!(reply.value, Bytes::from("v"));
        assert_eq!(reply.state, MesiState::Shared);
        assert_eq!(d.state("k"), MesiState::Shared);
    }

    #[test]
    fn probe_downgrades_exclusive_to_shared() {
        let mut d = dir(10);
        d.fill_exclusive("k", Bytes::from("v"));
        assert_eq!(d.state("k"), MesiState::Exclusive);

        let reply = d.handle_probe("k").unwrap();
        assert_eq!(reply.state, MesiState::Shared);
        assert_eq!(d.state("k"), MesiState::Shared);
    }

    #[test]
    fn probe_misses_on_absent_line() {
        let mut d = dir(10);
        assert!(d.handle_probe("nope").is_none());
    }

    #[test]
    fn lru_evicts_coldest_line() {
        let mut d = dir(2);
        d.fill_exclusive("a", Bytes::from("1"));
        d.fill_exclusive("b", Bytes::from("2"));

        // Touch a so b is the cold one.
        d.get("a");

        let evictions = d.fill_exclusive("c", Bytes::from("3"));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].key, "b");
        assert_eq!(evictions[0].writeback, None); // E needs no write-back

        assert_eq!(d.state("a"), MesiState::Exclusive);
        assert_eq!(d.state("b"), MesiState::Invalid);
        assert_eq!(d.state("c"), MesiState::Exclusive);
    }

    #[test]
    fn evicting_modified_line_carries_writeback() {
        let mut d = dir(1);
        d.apply_put("dirty", Bytes::from("v1"), "n1");

        let evictions = d.fill_shared("other", Bytes::from("v2"));
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].key, "dirty");
        assert_eq!(evictions[0].writeback, Some(Bytes::from("v1")));
    }

    #[test]
    fn apply_evict_clears_only_origin() {
        let mut a = CacheDirectory::new("a", 10);
        let mut b = CacheDirectory::new("b", 10);
        a.apply_put("k", Bytes::from("v"), "a");
        b.fill_shared("other", Bytes::from("x"));

        a.apply_evict("k", "a");
        b.apply_evict("k", "a");
        assert_eq!(a.state("k"), MesiState::Invalid);
        assert_eq!(b.state("other"), MesiState::Shared);
    }

    #[test]
    fn stats_track_hits_misses_evictions() {
        let mut d = dir(1);
        d.fill_exclusive("a", Bytes::from("1"));
        assert!(d.get("a").is_some());
        assert!(d.get("zzz").is_none());
        d.fill_exclusive("b", Bytes::from("2"));

        let stats = d.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn at_most_one_node_holds_m_or_e() {
        // Simulate the cluster-wide invariant across three directories.
        let mut nodes: Vec<CacheDirectory> = ["a", "b", "c"]
            .iter()
            .map(|id| CacheDirectory::new(*id, 10))
            .collect();

        // a writes, then b writes, then c reads via probe from b.
        for node in nodes.iter_mut() {
            node.apply_put("k", Bytes::from("1"), "a");
        }
        for node in nodes.iter_mut() {
            node.apply_put("k", Bytes::from("2"), "b");
        }
        let reply = nodes[1].handle_probe("k").unwrap();
        nodes[2].fill_shared("k", reply.value);

        // The probe downgraded b's M to S before c entered S; nobody holds
        // M or E anymore.
        let exclusive_holders = nodes
            .iter()
            .filter(|n| matches!(n.state("k"), MesiState::Modified | MesiState::Exclusive))
            .count();
        assert_eq!(exclusive_holders, 0);
        assert_eq!(nodes[0].state("k"), MesiState::Invalid);
        assert_eq!(nodes[1].state("k"), MesiState::Shared);
        assert_eq!(nodes[2].state("k"), MesiState::Shared);
    }
}
