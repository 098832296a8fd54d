//! Consensus error types.

use crate::types::NodeId;
use thiserror::Error;

/// Errors surfaced by the consensus core.
///
/// Replication-internal failures (lost RPCs, log mismatches, stepdowns) are
/// absorbed by retries and role changes and never appear here; what remains
/// is what callers genuinely need to act on.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node cannot serve the request; retry against the hinted leader.
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The proposed entry did not commit within the wait window. The entry
    /// itself may still commit later; only the wait was abandoned.
    #[error("commit wait timed out after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// An RPC to a peer failed outright (not a rejection).
    #[error("rpc to {peer} failed: {reason}")]
    Rpc { peer: NodeId, reason: String },

    /// Durable state (log or vote record) could not be written. Fatal: the
    /// safety argument rests on durability, so the node must stop.
    #[error("persistence failure: {source}")]
    Persistence {
        #[from]
        source: std::io::Error,
    },

    /// Entry or RPC encoding failed.
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// The node is shutting down.
    #[error("raft shut down")]
    Shutdown,
}

impl RaftError {
    /// Persistence failures poison the node; everything else is retryable
    /// at some level.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Persistence { .. })
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
