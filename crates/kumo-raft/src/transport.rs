//! Transport abstraction for consensus RPCs.
//!
//! The consensus core is transport-agnostic: production wires these calls
//! over the cluster's framed TCP envelopes, tests use in-process channels.
//! Transports surface failures as errors; the election and replication loops
//! treat any RPC error as a lost message and move on.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// RPC client to a single cluster's peers.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Ask a peer for its vote.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Replicate entries (or heartbeat with an empty batch).
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Incoming RPC with its reply slot.
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// In-memory transport for tests: each node is an mpsc inbox of
/// [`RpcMessage`]s drained by its rpc handler loop.
pub struct InMemoryTransport {
    peers: parking_lot::RwLock<HashMap<NodeId, RpcSender>>,
}

impl InMemoryTransport {
    pub fn new(peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            peers: parking_lot::RwLock::new(peers),
        }
    }

    pub fn add_peer(&self, peer: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer, sender);
    }

    /// Cut the link to a peer (partition simulation).
    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers.write().remove(peer);
    }

    fn peer(&self, id: &NodeId) -> Result<RpcSender> {
        self.peers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RaftError::Rpc {
                peer: id.clone(),
                reason: "peer unreachable".to_string(),
            })
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let peer = self.peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
        .map_err(|_| RaftError::Rpc {
            peer: target.clone(),
            reason: "inbox closed".to_string(),
        })?;

        response_rx.await.map_err(|_| RaftError::Rpc {
            peer: target.clone(),
            reason: "no response".to_string(),
        })
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let peer = self.peer(target)?;
        let (response_tx, response_rx) = oneshot::channel();
        peer.send(RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
        .map_err(|_| RaftError::Rpc {
            peer: target.clone(),
            reason: "inbox closed".to_string(),
        })?;

        response_rx.await.map_err(|_| RaftError::Rpc {
            peer: target.clone(),
            reason: "no response".to_string(),
        })
    }
}
