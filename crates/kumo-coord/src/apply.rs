//! The deterministic command dispatcher.
//!
//! One entry point: `apply(index, raw_command)`. Decodes the command once,
//! pattern-matches, and invokes the owning service with a single mutex held
//! over all three tables so each log entry applies atomically. Handlers do
//! no I/O beyond the sink handle the queue and cache services own.
//!
//! The returned [`Applied`] tells the node layer what happened so it can
//! resolve waiting client calls (lock grants, reserved messages, required
//! evictions).

use crate::cache::{CacheDirectory, CacheStats, Eviction, MesiState, ProbeReply};
use crate::command::Command;
use crate::error::{CoordError, Result};
use crate::lock::{AbortApplied, AcquireApplied, LockInfo, LockTable, ReleaseApplied};
use crate::queue::{QueueApplied, QueueMessage, QueueStats, QueueStore};
use bytes::Bytes;
use kumo_sink::KvSink;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of applying one committed entry.
#[derive(Debug)]
pub enum Applied {
    LockAcquire {
        resource: String,
        client: String,
        outcome: AcquireApplied,
    },
    LockRelease {
        resource: String,
        client: String,
        outcome: ReleaseApplied,
    },
    LockAbort {
        client: String,
        outcome: AbortApplied,
    },
    Queue(QueueApplied),
    CachePut {
        key: String,
        origin: String,
        evictions: Vec<Eviction>,
    },
    CacheInvalidate {
        key: String,
        origin: String,
    },
    CacheEvict {
        key: String,
        origin: String,
    },
}

struct Services {
    locks: LockTable,
    queue: QueueStore,
    cache: CacheDirectory,
}

/// The replicated state machine of one node.
pub struct Dispatcher {
    node_id: String,
    services: Mutex<Services>,
    sink: Arc<dyn KvSink>,
}

impl Dispatcher {
    pub fn new(node_id: impl Into<String>, cache_capacity: usize, sink: Arc<dyn KvSink>) -> Self {
        let node_id = node_id.into();
        Self {
            services: Mutex::new(Services {
                locks: LockTable::new(),
                queue: QueueStore::new(sink.clone()),
                cache: CacheDirectory::new(node_id.clone(), cache_capacity),
            }),
            node_id,
            sink,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Apply the committed entry at `index`. Deterministic: same command,
    /// same index, same prior state yields the same outcome on every node.
    pub fn apply(&self, index: u64, raw: &[u8]) -> Result<Applied> {
        let command = Command::decode(raw).map_err(|source| CoordError::Decode { index, source })?;
        let mut services = self.services.lock();

        let applied = match command {
            Command::LockAcquire {
                resource,
                client,
                mode,
            } => {
                let outcome = services.locks.acquire(&resource, &client, mode, index);
                Applied::LockAcquire {
                    resource,
                    client,
                    outcome,
                }
            }
            Command::LockRelease { resource, client } => {
                let outcome = services.locks.release(&resource, &client);
                Applied::LockRelease {
                    resource,
                    client,
                    outcome,
                }
            }
            Command::LockAbort { client } => {
                let outcome = services.locks.abort(&client);
                Applied::LockAbort { client, outcome }
            }

            Command::QueueEnqueue {
                queue,
                message_id,
                payload,
                produced_at_ms,
            } => Applied::Queue(services.queue.apply_enqueue(
                &queue,
                message_id,
                payload,
                produced_at_ms,
            )),
            Command::QueueReserve {
                message_id,
                consumer,
                visible_at_ms,
            } => Applied::Queue(services.queue.apply_reserve(
                message_id,
                &consumer,
                visible_at_ms,
            )),
            Command::QueueAck { message_id } => {
                Applied::Queue(services.queue.apply_ack(message_id))
            }
            Command::QueueReturn { message_id } => {
                Applied::Queue(services.queue.apply_return(message_id))
            }
            Command::QueueDead { message_id } => {
                Applied::Queue(services.queue.apply_dead(message_id))
            }

            Command::CachePut { key, value, origin } => {
                let evictions = services.cache.apply_put(&key, value, &origin);
                Applied::CachePut {
                    key,
                    origin,
                    evictions,
                }
            }
            Command::CacheInvalidate { key, origin } => {
                services.cache.apply_invalidate(&key, &origin);
                Applied::CacheInvalidate { key, origin }
            }
            Command::CacheEvict { key, value, origin } => {
                // Write-back of a dirty line: the backing store is the sink.
                if let Some(value) = value {
                    if let Err(e) = self.sink.put(&format!("cache/{key}"), value) {
                        tracing::warn!(error = %e, key, "cache write-back failed");
                    }
                }
                services.cache.apply_evict(&key, &origin);
                Applied::CacheEvict { key, origin }
            }
        };

        Ok(applied)
    }

    // --- read-side accessors (locally consistent snapshots) ---

    pub fn lock_inspect(&self) -> Vec<LockInfo> {
        self.services.lock().locks.inspect()
    }

    pub fn holds_lock(&self, resource: &str, client: &str) -> bool {
        self.services.lock().locks.holds(resource, client)
    }

    pub fn wait_for_edges(&self) -> Vec<(String, String)> {
        self.services.lock().locks.wait_for_edges()
    }

    pub fn waiter_ages(&self) -> std::collections::HashMap<String, u64> {
        self.services.lock().locks.waiter_ages()
    }

    pub fn next_pending(&self, queue: &str) -> Option<QueueMessage> {
        self.services.lock().queue.next_pending(queue).cloned()
    }

    pub fn expired_inflight(&self, now_ms: u64) -> Vec<(Uuid, u32)> {
        self.services.lock().queue.expired_inflight(now_ms)
    }

    pub fn inflight(&self, queue: &str) -> Vec<Uuid> {
        self.services.lock().queue.inflight(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.services.lock().queue.queue_names()
    }

    pub fn queue_stats(&self) -> BTreeMap<String, QueueStats> {
        self.services.lock().queue.stats()
    }

    pub fn message(&self, id: Uuid) -> Option<QueueMessage> {
        self.services.lock().queue.get(id).cloned()
    }

    pub fn cache_get_local(&self, key: &str) -> Option<Bytes> {
        self.services.lock().cache.get(key)
    }

    pub fn cache_state(&self, key: &str) -> MesiState {
        self.services.lock().cache.state(key)
    }

    pub fn cache_probe(&self, key: &str) -> Option<ProbeReply> {
        self.services.lock().cache.handle_probe(key)
    }

    pub fn cache_drop_if_clean(&self, key: &str) {
        self.services.lock().cache.drop_if_clean(key)
    }

    pub fn cache_fill_shared(&self, key: &str, value: Bytes) -> Vec<Eviction> {
        self.services.lock().cache.fill_shared(key, value)
    }

    pub fn cache_fill_exclusive(&self, key: &str, value: Bytes) -> Vec<Eviction> {
        self.services.lock().cache.fill_exclusive(key, value)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.services.lock().cache.stats()
    }

    /// Backing-store read used on a full cache miss.
    pub fn backing_get(&self, key: &str) -> Option<Bytes> {
        match self.sink.get(&format!("cache/{key}")) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, key, "backing store read failed");
                None
            }
        }
    }
}
