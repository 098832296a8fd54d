//! Wire adapters: consensus RPCs and client calls over transport envelopes.
//!
//! Consensus messages and client requests share the cluster transport. This
//! module defines the payload types and the [`RaftTransport`] implementation
//! that encodes typed RPCs into envelopes and decodes the correlated
//! replies.

use async_trait::async_trait;
use bytes::Bytes;
use kumo_raft::transport::RaftTransport;
use kumo_raft::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RaftError, RequestVoteRequest,
    RequestVoteResponse,
};
use kumo_transport::{Envelope, MessageKind, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Client-side calls carried in `ClientPropose` envelopes.
///
/// `Propose` is node-to-leader forwarding of an already-encoded command;
/// `Enqueue`/`Dequeue` are node-to-primary forwarding of queue operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRpc {
    Propose {
        command: Bytes,
    },
    Enqueue {
        queue: String,
        payload: Bytes,
    },
    Dequeue {
        queue: String,
        consumer: String,
        visibility_ms: u64,
    },
}

/// A delivered queue message as the client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: Uuid,
    pub payload: Bytes,
    pub attempts: u32,
}

/// Replies to [`ClientRpc`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRpcReply {
    /// The command was committed at this log index.
    Proposed { index: u64 },
    Enqueued { message_id: Uuid },
    Dequeued(Option<Delivery>),
    NotLeader { hint: Option<String> },
    LeaderUnknown,
    /// The serving node could not commit in time (e.g. it lost quorum).
    Timeout,
    Failed { reason: String },
}

/// Read-probe payloads for the cache service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheReadRequest {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheReadReply {
    pub reply: Option<kumo_coord::ProbeReply>,
}

/// Invalidate-hint payload (latency optimisation only; correctness comes
/// from the replicated CachePut).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidateHint {
    pub key: String,
}

fn rpc_error(peer: &NodeId, e: impl std::fmt::Display) -> RaftError {
    RaftError::Rpc {
        peer: peer.clone(),
        reason: e.to_string(),
    }
}

/// [`RaftTransport`] over the cluster envelope transport.
pub struct EnvelopeRaftTransport {
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl EnvelopeRaftTransport {
    pub fn new(transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            transport,
            rpc_timeout,
        }
    }

    async fn call<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        target: &NodeId,
        kind: MessageKind,
        request: &Req,
    ) -> kumo_raft::Result<Resp> {
        let payload = bincode::serialize(request).map_err(RaftError::from)?;
        let envelope = Envelope::new(kind, self.transport.local_id().to_string(), payload.into());

        let reply = self
            .transport
            .request(target.as_str(), envelope, self.rpc_timeout)
            .await
            .map_err(|e| rpc_error(target, e))?;

        bincode::deserialize(&reply.payload).map_err(RaftError::from)
    }
}

#[async_trait]
impl RaftTransport for EnvelopeRaftTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> kumo_raft::Result<RequestVoteResponse> {
        self.call(target, MessageKind::RequestVote, &request).await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> kumo_raft::Result<AppendEntriesResponse> {
        self.call(target, MessageKind::AppendEntries, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumo_raft::{LogIndex, Term};
    use kumo_transport::InMemoryMesh;

    #[tokio::test]
    async fn vote_rpc_over_envelopes() {
        let mesh = InMemoryMesh::new();
        let a = mesh.join("a");
        let b = mesh.join("b");

        // Peer b answers vote requests by hand.
        let b_clone = b.clone();
        tokio::spawn(async move {
            let envelope = b_clone.recv().await.unwrap();
            assert_eq!(envelope.kind, MessageKind::RequestVote);
            let request: RequestVoteRequest = bincode::deserialize(&envelope.payload).unwrap();
            let response = RequestVoteResponse {
                term: request.term,
                vote_granted: true,
            };
            let payload = bincode::serialize(&response).unwrap();
            let reply = envelope.reply_to(MessageKind::RequestVoteReply, "b", payload.into());
            b_clone.send(&envelope.sender, reply).await.unwrap();
        });

        let raft_transport =
            EnvelopeRaftTransport::new(a as Arc<dyn Transport>, Duration::from_secs(1));
        let response = raft_transport
            .request_vote(
                &NodeId::new("b"),
                RequestVoteRequest {
                    term: Term(4),
                    candidate_id: NodeId::new("a"),
                    last_log_index: LogIndex::ZERO,
                    last_log_term: Term::ZERO,
                },
            )
            .await
            .unwrap();

        assert!(response.vote_granted);
        assert_eq!(response.term, Term(4));
    }

    #[tokio::test]
    async fn unreachable_peer_maps_to_rpc_error() {
        let mesh = InMemoryMesh::new();
        let a = mesh.join("a");

        let raft_transport =
            EnvelopeRaftTransport::new(a as Arc<dyn Transport>, Duration::from_millis(100));
        let err = raft_transport
            .request_vote(
                &NodeId::new("ghost"),
                RequestVoteRequest {
                    term: Term(1),
                    candidate_id: NodeId::new("a"),
                    last_log_index: LogIndex::ZERO,
                    last_log_term: Term::ZERO,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Rpc { .. }));
    }
}
