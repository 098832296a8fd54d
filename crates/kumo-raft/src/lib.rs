//! kumo-raft: Raft consensus for the kumo coordination runtime.
//!
//! - Leader election with randomized timeouts
//! - Log replication with conflict-hint backtracking
//! - Durable vote state and append-only log, fsynced before acknowledgement
//! - Single-consumer apply stream feeding the replicated state machine
//!
//! Commands are opaque `Bytes`; the state machine living above this crate
//! decides what they mean. Based on the Raft paper (Ongaro & Ousterhout,
//! 2014), minus membership changes and log compaction: the cluster roster
//! is static and the log grows unbounded by design.

pub mod config;
pub mod election;
pub mod error;
pub mod hard_state;
pub mod log;
pub mod raft;
pub mod replication;
pub mod rpc_handler;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::{Raft, RaftStatus};
pub use types::*;

/// The single primitive the coordination services build on: propose a
/// command into the replicated log.
#[async_trait::async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Propose a command for replication. Leader-only; returns the log index
    /// the command will occupy once committed.
    async fn propose(&self, command: bytes::Bytes) -> Result<LogIndex>;

    /// Whether this node currently leads.
    fn is_leader(&self) -> bool;

    /// The current leader, if known.
    fn leader(&self) -> Option<NodeId>;
}
