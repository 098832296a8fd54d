//! kumo-transport: framed point-to-point messaging between cluster nodes.
//!
//! Provides:
//! - A self-describing [`Envelope`] wire record (kind, sender, correlation id,
//!   opaque payload)
//! - The [`Transport`] trait with send / request-response / broadcast, plus a
//!   TCP implementation and an in-memory channel mesh for tests
//! - A phi-accrual [`FailureDetector`](detector::FailureDetector) publishing
//!   `alive -> suspected -> failed -> alive` transitions
//!
//! Network errors never escape this crate as panics or ad-hoc errors: callers
//! observe them as request timeouts, and subscribers observe them as peer
//! state transitions.

pub mod codec;
pub mod detector;
pub mod memory;
pub mod tcp;

pub use detector::{heartbeat_loop, DetectorConfig, FailureDetector, PeerEvent, PeerState};
pub use memory::{InMemoryMesh, InMemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Message kinds carried on the cluster wire.
///
/// Every frame is tagged with one of these. A frame whose tag fails to decode
/// is logged and dropped by the receive loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    RequestVote,
    RequestVoteReply,
    AppendEntries,
    AppendEntriesReply,
    ClientPropose,
    ClientProposeReply,
    CacheRead,
    CacheReadReply,
    CacheInvalidate,
    Heartbeat,
}

impl MessageKind {
    /// Replies are routed to the pending-request table instead of the
    /// incoming queue.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::RequestVoteReply
                | MessageKind::AppendEntriesReply
                | MessageKind::ClientProposeReply
                | MessageKind::CacheReadReply
        )
    }
}

/// A single framed message.
///
/// The payload is opaque to the transport; higher layers encode their RPC
/// structs into it with bincode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender: String,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: MessageKind, sender: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            sender: sender.into(),
            correlation_id: 0,
            payload,
        }
    }

    /// Build the reply to a request envelope: same correlation id, reply kind.
    pub fn reply_to(&self, kind: MessageKind, sender: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            sender: sender.into(),
            correlation_id: self.correlation_id,
            payload,
        }
    }
}

/// Transport errors.
///
/// These stay inside the node: callers translate `Timeout` into their own
/// deadline errors and everything else into peer-state observations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("request to {peer} timed out after {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    #[error("connection to {peer} closed")]
    ConnectionClosed { peer: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Bidirectional message channel to every other node.
///
/// Implementations own the sockets (or channels); exactly one send path and
/// one receive loop exist per peer. `request` provides at-most-once local
/// delivery with a caller-supplied timeout; `broadcast` is a fan-out of
/// independent sends with no atomicity.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's id.
    fn local_id(&self) -> &str;

    /// Best-effort one-way send.
    async fn send(&self, peer: &str, envelope: Envelope) -> Result<()>;

    /// Send a request and wait for the correlated reply.
    async fn request(&self, peer: &str, envelope: Envelope, timeout: Duration) -> Result<Envelope>;

    /// Fan out an envelope to every known peer. Per-peer failures are
    /// swallowed; they surface through the failure detector instead.
    async fn broadcast(&self, envelope: Envelope);

    /// Receive the next non-reply envelope addressed to this node.
    async fn recv(&self) -> Result<Envelope>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_kinds() {
        assert!(MessageKind::AppendEntriesReply.is_reply());
        assert!(MessageKind::ClientProposeReply.is_reply());
        assert!(!MessageKind::AppendEntries.is_reply());
        assert!(!MessageKind::Heartbeat.is_reply());
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let mut req = Envelope::new(MessageKind::ClientPropose, "n1", Bytes::from("x"));
        req.correlation_id = 42;

        let reply = req.reply_to(MessageKind::ClientProposeReply, "n2", Bytes::new());
        assert_eq!(reply.correlation_id, 42);
        assert_eq!(reply.sender, "n2");
        assert_eq!(reply.kind, MessageKind::ClientProposeReply);
    }
}
