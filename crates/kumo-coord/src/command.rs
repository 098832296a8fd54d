//! The closed command set carried in the replicated log.
//!
//! Every mutating operation of the three services is one of these variants,
//! encoded with bincode into the opaque command bytes consensus replicates.
//! Timestamps (`produced_at_ms`, `visible_at_ms`) are computed by the
//! proposer and carried in the command so that applying is a pure function
//! of (command, state) on every replica.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Replicated state-machine commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    LockAcquire {
        resource: String,
        client: String,
        mode: LockMode,
    },
    LockRelease {
        resource: String,
        client: String,
    },
    /// Deadlock victim: strip the client from every holder set and queue.
    LockAbort {
        client: String,
    },

    QueueEnqueue {
        queue: String,
        message_id: Uuid,
        payload: Bytes,
        produced_at_ms: u64,
    },
    /// Hand the head pending message to a consumer until `visible_at_ms`.
    QueueReserve {
        message_id: Uuid,
        consumer: String,
        visible_at_ms: u64,
    },
    QueueAck {
        message_id: Uuid,
    },
    /// Visibility expired: back to pending.
    QueueReturn {
        message_id: Uuid,
    },
    /// Retries exhausted: to the dead-letter queue.
    QueueDead {
        message_id: Uuid,
    },

    CachePut {
        key: String,
        value: Bytes,
        origin: String,
    },
    CacheInvalidate {
        key: String,
        origin: String,
    },
    /// LRU eviction of a modified line; carries the final value for
    /// write-back to the backing sink.
    CacheEvict {
        key: String,
        value: Option<Bytes>,
        origin: String,
    },
}

impl Command {
    pub fn encode(&self) -> Result<Bytes, bincode::Error> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_survive_the_wire() {
        let commands = vec![
            Command::LockAcquire {
                resource: "r1".into(),
                client: "c1".into(),
                mode: LockMode::Exclusive,
            },
            Command::QueueEnqueue {
                queue: "orders".into(),
                message_id: Uuid::new_v4(),
                payload: Bytes::from_static(b"payload"),
                produced_at_ms: 1_700_000_000_000,
            },
            Command::CacheEvict {
                key: "k".into(),
                value: Some(Bytes::from_static(b"v")),
                origin: "n1".into(),
            },
        ];

        for command in commands {
            let decoded = Command::decode(&command.encode().unwrap()).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(Command::decode(b"\xff\xfe\xfd").is_err());
    }
}
