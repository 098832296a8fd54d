//! Replicated queue store: at-least-once delivery with ack, visibility
//! timeout, retry, and dead-lettering.
//!
//! Message lifecycle: pending -> inflight -> (acked | pending again | dead).
//! Acked and dead are terminal. `attempts` counts deliveries (reserves), so
//! a message whose attempts exceed the retry limit at visibility expiry has
//! been delivered `max_retries + 1` times and goes to the DLQ.
//!
//! Every replica applies the same commands in the same order; the sink
//! writes mirror the replicated state for durability.

use bytes::Bytes;
use kumo_sink::KvSink;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Distinguished queue receiving dead-lettered messages.
pub const DEAD_LETTER_QUEUE: &str = "__dlq";

/// Message lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Pending,
    Inflight,
    Acked,
    Dead,
}

/// One queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue: String,
    pub payload: Bytes,
    pub produced_at_ms: u64,
    pub attempts: u32,
    pub state: MessageState,
    /// When an inflight message becomes visible again.
    pub visible_at_ms: Option<u64>,
    pub consumer: Option<String>,
}

/// What applying a queue command did.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueApplied {
    Enqueued { queue: String, message_id: Uuid },
    /// Duplicate enqueue (replayed handover); nothing changed.
    EnqueueIgnored { message_id: Uuid },
    Reserved(Box<QueueMessage>),
    /// Reserve raced a state change; nothing was handed out.
    ReserveRejected { message_id: Uuid },
    Acked { message_id: Uuid },
    AckUnknown { message_id: Uuid },
    Returned { message_id: Uuid },
    ReturnIgnored { message_id: Uuid },
    Deadlettered { message_id: Uuid },
    DeadIgnored { message_id: Uuid },
}

/// Per-queue counters for the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub inflight: usize,
    pub dead: usize,
}

/// The replicated queue tables.
pub struct QueueStore {
    messages: HashMap<Uuid, QueueMessage>,
    /// FIFO order of pending message ids per queue.
    pending: BTreeMap<String, VecDeque<Uuid>>,
    sink: Arc<dyn KvSink>,
}

impl QueueStore {
    pub fn new(sink: Arc<dyn KvSink>) -> Self {
        Self {
            messages: HashMap::new(),
            pending: BTreeMap::new(),
            sink,
        }
    }

    fn sink_key(id: Uuid) -> String {
        format!("queue/{id}")
    }

    fn dlq_key(id: Uuid) -> String {
        format!("dlq/{id}")
    }

    fn persist(&self, message: &QueueMessage, key: String) {
        match bincode::serialize(message) {
            Ok(raw) => {
                if let Err(e) = self.sink.put(&key, Bytes::from(raw)) {
                    tracing::warn!(error = %e, key, "sink write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "message encoding for sink failed"),
        }
    }

    pub fn apply_enqueue(
        &mut self,
        queue: &str,
        message_id: Uuid,
        payload: Bytes,
        produced_at_ms: u64,
    ) -> QueueApplied {
        if self.messages.contains_key(&message_id) {
            // Handover re-proposals replay enqueues; the first apply wins.
            return QueueApplied::EnqueueIgnored { message_id };
        }

        let message = QueueMessage {
            id: message_id,
            queue: queue.to_string(),
            payload,
            produced_at_ms,
            attempts: 0,
            state: MessageState::Pending,
            visible_at_ms: None,
            consumer: None,
        };
        self.persist(&message, Self::sink_key(message_id));
        self.messages.insert(message_id, message);
        self.pending
            .entry(queue.to_string())
            .or_default()
            .push_back(message_id);

        QueueApplied::Enqueued {
            queue: queue.to_string(),
            message_id,
        }
    }

    pub fn apply_reserve(
        &mut self,
        message_id: Uuid,
        consumer: &str,
        visible_at_ms: u64,
    ) -> QueueApplied {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return QueueApplied::ReserveRejected { message_id };
        };
        if message.state != MessageState::Pending {
            return QueueApplied::ReserveRejected { message_id };
        }

        message.state = MessageState::Inflight;
        message.attempts += 1;
        message.consumer = Some(consumer.to_string());
        message.visible_at_ms = Some(visible_at_ms);

        if let Some(queue) = self.pending.get_mut(&message.queue) {
            queue.retain(|id| id != &message_id);
        }

        QueueApplied::Reserved(Box::new(message.clone()))
    }

    pub fn apply_ack(&mut self, message_id: Uuid) -> QueueApplied {
        match self.messages.get(&message_id).map(|m| m.state) {
            Some(MessageState::Inflight) | Some(MessageState::Pending) => {
                if let Some(message) = self.messages.get_mut(&message_id) {
                    message.state = MessageState::Acked;
                    let queue = message.queue.clone();
                    if let Some(ids) = self.pending.get_mut(&queue) {
                        ids.retain(|id| id != &message_id);
                    }
                }
                // Acked messages are gone for good: drop the table entry and
                // the durable copy.
                self.messages.remove(&message_id);
                if let Err(e) = self.sink.delete(&Self::sink_key(message_id)) {
                    tracing::warn!(error = %e, %message_id, "sink delete failed");
                }
                QueueApplied::Acked { message_id }
            }
            _ => QueueApplied::AckUnknown { message_id },
        }
    }

    pub fn apply_return(&mut self, message_id: Uuid) -> QueueApplied {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return QueueApplied::ReturnIgnored { message_id };
        };
        if message.state != MessageState::Inflight {
            return QueueApplied::ReturnIgnored { message_id };
        }

        message.state = MessageState::Pending;
        message.consumer = None;
        message.visible_at_ms = None;
        let queue = message.queue.clone();

        // Returned messages rejoin the head: they are older than anything
        // enqueued since they were handed out.
        self.pending
            .entry(queue)
            .or_default()
            .push_front(message_id);

        QueueApplied::Returned { message_id }
    }

    pub fn apply_dead(&mut self, message_id: Uuid) -> QueueApplied {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return QueueApplied::DeadIgnored { message_id };
        };
        if matches!(message.state, MessageState::Acked | MessageState::Dead) {
            return QueueApplied::DeadIgnored { message_id };
        }

        message.state = MessageState::Dead;
        message.consumer = None;
        message.visible_at_ms = None;
        let queue = message.queue.clone();
        if let Some(ids) = self.pending.get_mut(&queue) {
            ids.retain(|id| id != &message_id);
        }
        self.pending
            .entry(DEAD_LETTER_QUEUE.to_string())
            .or_default()
            .push_back(message_id);

        let snapshot = self.messages.get(&message_id).cloned();
        if let Some(message) = snapshot {
            self.persist(&message, Self::dlq_key(message_id));
        }
        if let Err(e) = self.sink.delete(&Self::sink_key(message_id)) {
            tracing::warn!(error = %e, %message_id, "sink delete failed");
        }

        QueueApplied::Deadlettered { message_id }
    }

    /// Head pending message of a queue, if any.
    pub fn next_pending(&self, queue: &str) -> Option<&QueueMessage> {
        self.pending
            .get(queue)?
            .front()
            .and_then(|id| self.messages.get(id))
    }

    /// Inflight messages whose visibility has expired at `now_ms`, with the
    /// attempt count the sweeper needs for the retry/DLQ decision.
    pub fn expired_inflight(&self, now_ms: u64) -> Vec<(Uuid, u32)> {
        self.messages
            .values()
            .filter(|m| {
                m.state == MessageState::Inflight
                    && m.visible_at_ms.map_or(false, |at| at <= now_ms)
            })
            .map(|m| (m.id, m.attempts))
            .collect()
    }

    /// Ids of all non-terminal messages in a queue (pending + inflight),
    /// used when queue primacy moves between nodes.
    pub fn non_acked(&self, queue: &str) -> Vec<Uuid> {
        self.messages
            .values()
            .filter(|m| {
                m.queue == queue
                    && matches!(m.state, MessageState::Pending | MessageState::Inflight)
            })
            .map(|m| m.id)
            .collect()
    }

    /// Ids of inflight messages in a queue.
    pub fn inflight(&self, queue: &str) -> Vec<Uuid> {
        self.messages
            .values()
            .filter(|m| m.queue == queue && m.state == MessageState::Inflight)
            .map(|m| m.id)
            .collect()
    }

    /// All queue names with live state, dead-letter queue included.
    pub fn queue_names(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn get(&self, message_id: Uuid) -> Option<&QueueMessage> {
        self.messages.get(&message_id)
    }

    pub fn stats(&self) -> BTreeMap<String, QueueStats> {
        let mut stats: BTreeMap<String, QueueStats> = BTreeMap::new();
        for message in self.messages.values() {
            let entry = stats.entry(message.queue.clone()).or_default();
            match message.state {
                MessageState::Pending => entry.pending += 1,
                MessageState::Inflight => entry.inflight += 1,
                MessageState::Dead => entry.dead += 1,
                MessageState::Acked => {}
            }
        }
        stats
    }
}
