//! In-memory transport mesh for tests (channels, no network).
//!
//! Mirrors the TCP transport's behaviour closely enough that consensus and
//! service logic can be exercised in-process: correlated request/response,
//! broadcast fan-out, and controllable partitions for fault tests.

use crate::{Envelope, Result, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Pending request table shared by the send and receive sides.
#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        (id, rx)
    }

    pub(crate) fn forget(&self, id: u64) {
        self.waiters.lock().remove(&id);
    }

    /// Route a reply to its waiter. Returns false if nobody was waiting
    /// (late reply after timeout), in which case the envelope is dropped.
    pub(crate) fn resolve(&self, envelope: Envelope) -> bool {
        if let Some(tx) = self.waiters.lock().remove(&envelope.correlation_id) {
            tx.send(envelope).is_ok()
        } else {
            false
        }
    }
}

/// State shared by every endpoint of one mesh: the inbox senders and the
/// set of currently-cut directed links.
#[derive(Default)]
struct MeshState {
    senders: RwLock<HashMap<String, mpsc::Sender<Envelope>>>,
    blocked: RwLock<HashSet<(String, String)>>,
}

impl MeshState {
    fn deliver(&self, from: &str, to: &str, envelope: Envelope) -> Result<()> {
        if self
            .blocked
            .read()
            .contains(&(from.to_string(), to.to_string()))
        {
            // Partitioned links swallow the message; the caller sees a
            // timeout, exactly like a dead TCP peer.
            return Ok(());
        }
        let sender = self
            .senders
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        sender
            .try_send(envelope)
            .map_err(|_| TransportError::ConnectionClosed {
                peer: to.to_string(),
            })?;
        Ok(())
    }

    fn peer_ids(&self, excluding: &str) -> Vec<String> {
        self.senders
            .read()
            .keys()
            .filter(|id| id.as_str() != excluding)
            .cloned()
            .collect()
    }
}

/// A mesh of in-memory transports, one per node id.
///
/// Build the mesh first, then hand each node its transport. `partition`
/// cuts every link between the two groups (both directions); `heal`
/// restores full connectivity.
pub struct InMemoryMesh {
    state: Arc<MeshState>,
}

impl InMemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MeshState::default()),
        })
    }

    /// Create (and register) the transport for one node.
    pub fn join(&self, node_id: impl Into<String>) -> Arc<InMemoryTransport> {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(1024);
        self.state.senders.write().insert(node_id.clone(), tx);

        Arc::new(InMemoryTransport {
            local_id: node_id,
            mesh: self.state.clone(),
            pending: PendingRequests::default(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Cut every link between `group_a` and `group_b`, both directions.
    pub fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        let mut blocked = self.state.blocked.write();
        for a in group_a {
            for b in group_b {
                blocked.insert((a.to_string(), b.to_string()));
                blocked.insert((b.to_string(), a.to_string()));
            }
        }
    }

    /// Restore full connectivity.
    pub fn heal(&self) {
        self.state.blocked.write().clear();
    }
}

/// One node's endpoint in an [`InMemoryMesh`].
pub struct InMemoryTransport {
    local_id: String,
    mesh: Arc<MeshState>,
    pending: PendingRequests,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
}

impl InMemoryTransport {
    /// Pull the next envelope, routing replies to their waiters and
    /// returning everything else.
    async fn route_next(&self) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let envelope = inbox.recv().await.ok_or(TransportError::Shutdown)?;
            if envelope.kind.is_reply() {
                if !self.pending.resolve(envelope) {
                    tracing::debug!("dropping late reply");
                }
                continue;
            }
            return Ok(envelope);
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn send(&self, peer: &str, envelope: Envelope) -> Result<()> {
        self.mesh.deliver(&self.local_id, peer, envelope)
    }

    async fn request(&self, peer: &str, mut envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let (id, rx) = self.pending.register();
        envelope.correlation_id = id;

        if let Err(e) = self.mesh.deliver(&self.local_id, peer, envelope) {
            self.pending.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.forget(id);
                Err(TransportError::ConnectionClosed {
                    peer: peer.to_string(),
                })
            }
            Err(_) => {
                self.pending.forget(id);
                Err(TransportError::Timeout {
                    peer: peer.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn broadcast(&self, envelope: Envelope) {
        for peer in self.mesh.peer_ids(&self.local_id) {
            if let Err(e) = self.mesh.deliver(&self.local_id, &peer, envelope.clone()) {
                tracing::debug!(peer = %peer, error = %e, "broadcast send failed");
            }
        }
    }

    async fn recv(&self) -> Result<Envelope> {
        self.route_next().await
    }
}
