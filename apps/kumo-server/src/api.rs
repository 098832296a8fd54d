//! Client-facing result and error types.

use kumo_raft::{LogIndex, NodeId, Role, Term};
use kumo_transport::PeerState;
use thiserror::Error;

/// Errors surfaced to clients. Everything consensus-internal (lost RPCs,
/// stepdowns, log conflicts) has already been absorbed below this layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation did not complete before its deadline. No state change
    /// is implied either way.
    #[error("deadline exceeded")]
    Timeout,

    /// This node is not the leader; retry against the hint.
    #[error("not leader (hint: {hint:?})")]
    NotLeader { hint: Option<String> },

    /// No leader is currently elected; retry with backoff.
    #[error("leader unknown")]
    LeaderUnknown,

    /// The lock request was killed as a deadlock victim.
    #[error("aborted: deadlock victim")]
    AbortedDeadlock,

    /// Release by a client that neither holds nor waits.
    #[error("not holder")]
    NotHolder,

    /// Ack of a message this cluster does not know (or already settled).
    #[error("unknown message {0}")]
    UnknownMessage(uuid::Uuid),

    /// Durable state failed; the node is shutting down.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Anything unexpected (should not reach clients in practice).
    #[error("internal: {0}")]
    Internal(String),
}

impl From<kumo_raft::RaftError> for ClientError {
    fn from(e: kumo_raft::RaftError) -> Self {
        match e {
            kumo_raft::RaftError::NotLeader { leader: Some(hint) } => ClientError::NotLeader {
                hint: Some(hint.0),
            },
            kumo_raft::RaftError::NotLeader { leader: None } => ClientError::LeaderUnknown,
            kumo_raft::RaftError::CommitTimeout { .. } => ClientError::Timeout,
            kumo_raft::RaftError::Persistence { source } => {
                ClientError::Persistence(source.to_string())
            }
            other => ClientError::Internal(other.to_string()),
        }
    }
}

/// `Cluster.Status()` response.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub peers: Vec<PeerStatus>,
}

/// One peer as seen by the local failure detector.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub node_id: String,
    pub state: PeerState,
    pub phi: f64,
}
