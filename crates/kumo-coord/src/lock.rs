//! Replicated lock table: shared/exclusive modes with FIFO wait queues.
//!
//! All mutations run inside the apply path, so every method here is a pure
//! function of (arguments, table state). Waiter age is the log index of the
//! `LockAcquire` entry, which is identical on every replica.
//!
//! Grant rules:
//! - shared is grantable when the lock is free or shared-held AND nothing is
//!   queued (a queued exclusive must not be overtaken by later shareds)
//! - exclusive is grantable only when the lock is free and nothing is queued
//!
//! On release, the queue head is promoted: an exclusive head takes the lock
//! alone; a shared head pulls in the whole leading run of shared waiters.

use crate::command::LockMode;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A queued acquire request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    pub client: String,
    pub mode: LockMode,
    /// Log index of the LockAcquire entry; the replica-consistent notion of
    /// "when this request arrived".
    pub enqueued_at: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    mode: Option<LockMode>,
    holders: BTreeSet<String>,
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// Result of applying a `LockAcquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireApplied {
    /// Granted immediately (also returned for a re-acquire by a holder).
    Granted,
    /// Queued behind current holders/waiters.
    Queued,
}

/// Result of applying a `LockRelease`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseApplied {
    /// The client held the lock; the listed waiters were promoted.
    Released { granted: Vec<Waiter> },
    /// The client was only queued; its request is cancelled.
    Cancelled,
    /// The client neither held nor waited.
    NotHolder,
}

/// Result of applying a `LockAbort` (deadlock victim removal).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbortApplied {
    /// Resources the victim held and lost.
    pub released: Vec<String>,
    /// Resources where the victim's queued request was cancelled.
    pub cancelled: Vec<String>,
    /// Waiters promoted as a consequence, with their resources.
    pub granted: Vec<(String, Waiter)>,
}

/// Read-only summary of one lock, for inspection.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub resource: String,
    pub mode: Option<LockMode>,
    pub holders: Vec<String>,
    pub queue_depth: usize,
}

/// The lock table.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<String, LockEntry>,
    /// Reverse index: client -> resources held. Drives abort.
    held_by_client: HashMap<String, BTreeSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &mut self,
        resource: &str,
        client: &str,
        mode: LockMode,
        enqueued_at: u64,
    ) -> AcquireApplied {
        let entry = self.locks.entry(resource.to_string()).or_default();

        if entry.holders.contains(client) {
            // Re-acquire by a holder is a no-op grant.
            return AcquireApplied::Granted;
        }

        let grantable = match mode {
            LockMode::Shared => {
                entry.queue.is_empty()
                    && matches!(entry.mode, None | Some(LockMode::Shared))
            }
            LockMode::Exclusive => entry.holders.is_empty() && entry.queue.is_empty(),
        };

        if grantable {
            entry.mode = Some(mode);
            entry.holders.insert(client.to_string());
            self.held_by_client
                .entry(client.to_string())
                .or_default()
                .insert(resource.to_string());
            AcquireApplied::Granted
        } else {
            entry.queue.push_back(Waiter {
                client: client.to_string(),
                mode,
                enqueued_at,
            });
            AcquireApplied::Queued
        }
    }

    pub fn release(&mut self, resource: &str, client: &str) -> ReleaseApplied {
        let Some(entry) = self.locks.get_mut(resource) else {
            return ReleaseApplied::NotHolder;
        };

        if entry.holders.remove(client) {
            if let Some(held) = self.held_by_client.get_mut(client) {
                held.remove(resource);
                if held.is_empty() {
                    self.held_by_client.remove(client);
                }
            }

            let granted = if entry.holders.is_empty() {
                entry.mode = None;
                Self::promote_inner(entry)
            } else {
                Vec::new()
            };

            for waiter in &granted {
                self.held_by_client
                    .entry(waiter.client.clone())
                    .or_default()
                    .insert(resource.to_string());
            }

            if self.locks.get(resource).map_or(false, LockEntry::is_empty) {
                self.locks.remove(resource);
            }
            return ReleaseApplied::Released { granted };
        }

        // Not a holder: treat as a queued-request cancel if present.
        let before = entry.queue.len();
        entry.queue.retain(|w| w.client != client);
        if entry.queue.len() < before {
            if entry.is_empty() {
                self.locks.remove(resource);
            }
            ReleaseApplied::Cancelled
        } else {
            ReleaseApplied::NotHolder
        }
    }

    /// Promote the queue head once holders are gone: an exclusive head takes
    /// the slot alone, a shared head takes the leading shared run with it.
    fn promote_inner(entry: &mut LockEntry) -> Vec<Waiter> {
        let mut granted = Vec::new();
        let Some(head) = entry.queue.front() else {
            return granted;
        };

        match head.mode {
            LockMode::Exclusive => {
                if let Some(waiter) = entry.queue.pop_front() {
                    entry.mode = Some(LockMode::Exclusive);
                    entry.holders.insert(waiter.client.clone());
                    granted.push(waiter);
                }
            }
            LockMode::Shared => {
                entry.mode = Some(LockMode::Shared);
                while entry
                    .queue
                    .front()
                    .map_or(false, |w| w.mode == LockMode::Shared)
                {
                    if let Some(waiter) = entry.queue.pop_front() {
                        entry.holders.insert(waiter.client.clone());
                        granted.push(waiter);
                    }
                }
            }
        }
        granted
    }

    /// Strip a deadlock victim from every holder set and wait queue,
    /// promoting whoever unblocks.
    pub fn abort(&mut self, client: &str) -> AbortApplied {
        let mut applied = AbortApplied::default();

        let held: Vec<String> = self
            .held_by_client
            .remove(client)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for resource in held {
            if let Some(entry) = self.locks.get_mut(&resource) {
                entry.holders.remove(client);
                applied.released.push(resource.clone());

                let granted = if entry.holders.is_empty() {
                    entry.mode = None;
                    Self::promote_inner(entry)
                } else {
                    Vec::new()
                };
                for waiter in granted {
                    self.held_by_client
                        .entry(waiter.client.clone())
                        .or_default()
                        .insert(resource.clone());
                    applied.granted.push((resource.clone(), waiter));
                }
            }
        }

        // Cancel queued requests everywhere.
        let mut emptied = Vec::new();
        for (resource, entry) in self.locks.iter_mut() {
            let before = entry.queue.len();
            entry.queue.retain(|w| w.client != client);
            if entry.queue.len() < before {
                applied.cancelled.push(resource.clone());
            }
            if entry.is_empty() {
                emptied.push(resource.clone());
            }
        }
        for resource in emptied {
            self.locks.remove(&resource);
        }

        applied
    }

    /// Directed wait-for edges: waiter -> holder for every queued request,
    /// plus the waiter's age for victim selection. Rebuilt from scratch on
    /// each deadlock scan.
    pub fn wait_for_edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for entry in self.locks.values() {
            for waiter in &entry.queue {
                for holder in &entry.holders {
                    if holder != &waiter.client {
                        edges.push((waiter.client.clone(), holder.clone()));
                    }
                }
            }
        }
        edges
    }

    /// Earliest enqueue index per waiting client (its "age").
    pub fn waiter_ages(&self) -> HashMap<String, u64> {
        let mut ages: HashMap<String, u64> = HashMap::new();
        for entry in self.locks.values() {
            for waiter in &entry.queue {
                ages.entry(waiter.client.clone())
                    .and_modify(|age| *age = (*age).min(waiter.enqueued_at))
                    .or_insert(waiter.enqueued_at);
            }
        }
        ages
    }

    /// Whether `client` currently holds `resource`.
    pub fn holds(&self, resource: &str, client: &str) -> bool {
        self.locks
            .get(resource)
            .map_or(false, |e| e.holders.contains(client))
    }

    /// Snapshot for the inspection endpoint.
    pub fn inspect(&self) -> Vec<LockInfo> {
        self.locks
            .iter()
            .map(|(resource, entry)| LockInfo {
                resource: resource.clone(),
                mode: entry.mode,
                holders: entry.holders.iter().cloned().collect(),
                queue_depth: entry.queue.len(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_then_exclusive_queues() {
        let mut table = LockTable::new();
        assert_eq!(
            table.acquire("r", "x", LockMode::Exclusive, 1),
            AcquireApplied::Granted
        );
        assert_eq!(
            table.acquire("r", "y", LockMode::Exclusive, 2),
            AcquireApplied::Queued
        );

        match table.release("r", "x") {
            ReleaseApplied::Released { granted } => {
                assert_eq!(granted.len(), 1);
                assert_eq!(granted[0].client, "y");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(table.holds("r", "y"));
    }

    #[test]
    fn shared_locks_coexist() {
        let mut table = LockTable::new();
        assert_eq!(
            table.acquire("r", "a", LockMode::Shared, 1),
            AcquireApplied::Granted
        );
        assert_eq!(
            table.acquire("r", "b", LockMode::Shared, 2),
            AcquireApplied::Granted
        );
        assert!(table.holds("r", "a"));
        assert!(table.holds("r", "b"));
    }

    #[test]
    fn later_shared_cannot_skip_queued_exclusive() {
        let mut table = LockTable::new();
        table.acquire("r", "a", LockMode::Shared, 1);
        assert_eq!(
            table.acquire("r", "w", LockMode::Exclusive, 2),
            AcquireApplied::Queued
        );
        // The writer is at the head; a later shared request must wait.
        assert_eq!(
            table.acquire("r", "b", LockMode::Shared, 3),
            AcquireApplied::Queued
        );

        // Releasing the shared holder grants the writer alone.
        match table.release("r", "a") {
            ReleaseApplied::Released { granted } => {
                assert_eq!(granted.len(), 1);
                assert_eq!(granted[0].client, "w");
                assert_eq!(granted[0].mode, LockMode::Exclusive);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!table.holds("r", "b"));
    }

    #[test]
    fn shared_run_promoted_together() {
        let mut table = LockTable::new();
        table.acquire("r", "w", LockMode::Exclusive, 1);
        table.acquire("r", "a", LockMode::Shared, 2);
        table.acquire("r", "b", LockMode::Shared, 3);
        table.acquire("r", "w2", LockMode::Exclusive, 4);
        table.acquire("r", "c", LockMode::Shared, 5);

        match table.release("r", "w") {
            ReleaseApplied::Released { granted } => {
                // The leading shared run [a, b] is granted; w2 stays queued
                // and c stays behind w2.
                let clients: Vec<&str> = granted.iter().map(|w| w.client.as_str()).collect();
                assert_eq!(clients, vec!["a", "b"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(table.holds("r", "a"));
        assert!(table.holds("r", "b"));
        assert!(!table.holds("r", "w2"));
        assert!(!table.holds("r", "c"));
    }

    #[test]
    fn release_without_holding_is_not_holder() {
        let mut table = LockTable::new();
        assert_eq!(table.release("r", "ghost"), ReleaseApplied::NotHolder);

        table.acquire("r", "x", LockMode::Exclusive, 1);
        assert_eq!(table.release("r", "ghost"), ReleaseApplied::NotHolder);
        // Idempotent: the real holder releases once, a second release is
        // NotHolder again.
        assert!(matches!(
            table.release("r", "x"),
            ReleaseApplied::Released { .. }
        ));
        assert_eq!(table.release("r", "x"), ReleaseApplied::NotHolder);
    }

    #[test]
    fn release_of_queued_request_cancels_it() {
        let mut table = LockTable::new();
        table.acquire("r", "x", LockMode::Exclusive, 1);
        table.acquire("r", "y", LockMode::Exclusive, 2);

        assert_eq!(table.release("r", "y"), ReleaseApplied::Cancelled);
        // x still holds; nothing was promoted behind y's back.
        assert!(table.holds("r", "x"));
    }

    #[test]
    fn entry_removed_when_free_and_unqueued() {
        let mut table = LockTable::new();
        table.acquire("r", "x", LockMode::Exclusive, 1);
        table.release("r", "x");
        assert!(table.is_empty());
    }

    #[test]
    fn abort_releases_and_cancels_everywhere() {
        let mut table = LockTable::new();
        table.acquire("r1", "x", LockMode::Exclusive, 1);
        table.acquire("r2", "y", LockMode::Exclusive, 2);
        table.acquire("r2", "x", LockMode::Exclusive, 3); // x waits on y
        table.acquire("r1", "y", LockMode::Exclusive, 4); // y waits on x

        let applied = table.abort("y");
        assert_eq!(applied.released, vec!["r2".to_string()]);
        assert_eq!(applied.cancelled, vec!["r1".to_string()]);
        // x's queued request on r2 is promoted once y is gone.
        assert_eq!(applied.granted.len(), 1);
        assert_eq!(applied.granted[0].0, "r2");
        assert_eq!(applied.granted[0].1.client, "x");
        assert!(table.holds("r2", "x"));
        assert!(table.holds("r1", "x"));
    }

    #[test]
    fn wait_for_edges_reflect_blocking() {
        let mut table = LockTable::new();
        table.acquire("r1", "x", LockMode::Exclusive, 1);
        table.acquire("r1", "y", LockMode::Exclusive, 2);

        let edges = table.wait_for_edges();
        assert_eq!(edges, vec![("y".to_string(), "x".to_string())]);

        let ages = table.waiter_ages();
        assert_eq!(ages.get("y"), Some(&2));
    }

    #[test]
    fn invariants_hold_across_a_workload() {
        let mut table = LockTable::new();
        table.acquire("r", "a", LockMode::Shared, 1);
        table.acquire("r", "b", LockMode::Shared, 2);
        table.acquire("r", "w", LockMode::Exclusive, 3);
        table.release("r", "a");
        table.release("r", "b");

        // Exclusive now held by exactly one client.
        for info in table.inspect() {
            match info.mode {
                Some(LockMode::Exclusive) => assert_eq!(info.holders.len(), 1),
                Some(LockMode::Shared) => assert!(!info.holders.is_empty()),
                None => assert!(info.holders.is_empty()),
            }
        }
        assert!(table.holds("r", "w"));
    }
}
