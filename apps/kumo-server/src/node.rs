//! One kumo node: transport, consensus, state machine, and the service API.
//!
//! Wiring: the receive loop feeds consensus RPCs into the raft inbox,
//! answers cache probes, and serves forwarded client calls. The apply task
//! drains the committed-entry stream into the dispatcher, records per-index
//! outcomes for waiting client calls, and resolves lock-grant waiters.
//! Leader-only duties (deadlock scanning) and primary-only duties
//! (visibility sweeping, queue handover) run as periodic tasks that check
//! their role on every tick.

use crate::api::{ClientError, ClusterStatus, PeerStatus};
use crate::config::ServerConfig;
use crate::rpc::{
    CacheInvalidateHint, CacheReadReply, CacheReadRequest, ClientRpc, ClientRpcReply, Delivery,
    EnvelopeRaftTransport,
};
use bytes::Bytes;
use kumo_coord::{
    deadlock, AcquireApplied, Applied, Command, Dispatcher, LockInfo, LockMode, QueueApplied,
    ReleaseApplied, DEAD_LETTER_QUEUE,
};
use kumo_raft::transport::{RaftTransport, RpcMessage, RpcSender};
use kumo_raft::{NodeId, Raft, RaftConfig, ReplicatedLog};
use kumo_ring::HashRing;
use kumo_sink::KvSink;
use kumo_transport::{DetectorConfig, Envelope, FailureDetector, MessageKind, Transport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, oneshot, watch};
use uuid::Uuid;

/// Window for forwarded client calls; generous enough to cover a commit.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(6);

/// Default window for waiting on local apply of a committed entry.
const APPLY_WAIT: Duration = Duration::from_secs(10);

/// Cache probe fan-out timeout per peer.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Visibility sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Retained per-index outcomes for late waiters.
const OUTCOME_WINDOW: u64 = 4096;

/// Condensed per-index apply outcome, enough for the originating client
/// call to build its reply.
#[derive(Debug, Clone)]
enum Outcome {
    AcquireGranted,
    AcquireQueued,
    ReleaseOk,
    ReleaseCancelled,
    ReleaseNotHolder,
    Enqueued(Uuid),
    Reserved(Delivery),
    ReserveRejected,
    AckOk,
    AckUnknown,
    Other,
}

/// Resolution of a queued lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantResult {
    Granted,
    Aborted,
}

type GrantKey = (String, String); // (resource, client)

pub struct Node {
    node_id: String,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    raft: Arc<Raft>,
    dispatcher: Arc<Dispatcher>,
    detector: Arc<FailureDetector>,
    rpc_tx: RpcSender,
    applied_tx: watch::Sender<u64>,
    outcomes: Mutex<BTreeMap<u64, Outcome>>,
    grant_waiters: Mutex<HashMap<GrantKey, Vec<oneshot::Sender<GrantResult>>>>,
    fatal_tx: watch::Sender<Option<String>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Self-handle for tasks spawned from `&self` methods.
    weak: Weak<Node>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Node {
    /// Assemble a node from its config, transport, and durable sink.
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn KvSink>,
    ) -> Result<Arc<Self>, ClientError> {
        let node_id = config.node_id.clone();

        let mut roster_ids: Vec<NodeId> = config
            .roster()
            .map_err(|e| ClientError::Internal(e.to_string()))?
            .keys()
            .map(NodeId::new)
            .collect();
        roster_ids.sort();

        let raft_config = RaftConfig {
            heartbeat_interval: config.heartbeat_interval(),
            election_timeout_min: config.election_timeout_min(),
            election_timeout_max: config.election_timeout_max(),
            ..Default::default()
        };
        raft_config
            .validate()
            .map_err(ClientError::Internal)?;

        let (rpc_tx, rpc_rx) = tokio::sync::mpsc::channel(256);
        let raft_transport: Arc<dyn RaftTransport> = Arc::new(EnvelopeRaftTransport::new(
            transport.clone(),
            raft_config.rpc_timeout,
        ));

        let (raft, _recovery) = Raft::open(
            NodeId::new(node_id.clone()),
            raft_config,
            roster_ids.clone(),
            config.raft_dir(),
            raft_transport,
            Some(rpc_rx),
        )
        .map_err(|e| ClientError::Persistence(e.to_string()))?;

        let detector = FailureDetector::new(
            DetectorConfig {
                suspected_threshold: config.phi_suspected_threshold,
                failed_threshold: config.phi_failed_threshold,
                heartbeat_interval: config.heartbeat_interval(),
                ..Default::default()
            },
            roster_ids
                .iter()
                .filter(|id| id.as_str() != node_id)
                .map(|id| id.as_str().to_string()),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            node_id.clone(),
            config.cache_capacity,
            sink,
        ));

        let (applied_tx, _) = watch::channel(0);
        let (fatal_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = broadcast::channel(8);

        Ok(Arc::new_cyclic(|weak| Self {
            node_id,
            config,
            transport,
            raft: Arc::new(raft),
            dispatcher,
            detector,
            rpc_tx,
            applied_tx,
            outcomes: Mutex::new(BTreeMap::new()),
            grant_waiters: Mutex::new(HashMap::new()),
            fatal_tx,
            shutdown_tx,
            weak: weak.clone(),
        }))
    }

    fn handle(&self) -> Option<Arc<Self>> {
        self.weak.upgrade()
    }

    /// Spawn every background task and start consensus.
    pub fn start(&self) {
        let Some(this) = self.handle() else { return };

        self.raft.start();

        tokio::spawn(this.clone().recv_loop());

        if let Some(applied_rx) = self.raft.take_applied() {
            tokio::spawn(this.clone().apply_task(applied_rx));
        }

        tokio::spawn(kumo_transport::heartbeat_loop(
            self.transport.clone(),
            self.config.heartbeat_interval(),
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(self.detector.clone().run(self.shutdown_tx.subscribe()));

        tokio::spawn(this.clone().deadlock_scanner());
        tokio::spawn(this.clone().visibility_sweeper());
        tokio::spawn(this.rebalancer());

        // Surface raft-level fatal errors (failed durable writes) on the
        // node's own fatal channel.
        let raft_fatal = self.raft.subscribe_fatal();
        let fatal_tx = self.fatal_tx.clone();
        tokio::spawn(async move {
            let mut raft_fatal = raft_fatal;
            while raft_fatal.changed().await.is_ok() {
                if let Some(reason) = raft_fatal.borrow().clone() {
                    let _ = fatal_tx.send(Some(reason));
                    break;
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.raft.shutdown();
        let _ = self.shutdown_tx.send(());
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set when the node must stop (durable write failure or replica
    /// divergence). The process exits with code 2 on this signal.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    /// `Lock.Acquire`: granted within `wait`, or timeout/abort.
    pub async fn lock_acquire(
        &self,
        resource: &str,
        client: &str,
        mode: LockMode,
        wait: Duration,
    ) -> Result<(), ClientError> {
        let deadline = Instant::now() + wait;
        let key: GrantKey = (resource.to_string(), client.to_string());

        // Register for a possible later grant before proposing, so the
        // grant cannot slip past between apply and registration.
        let grant_rx = self.register_grant_waiter(key.clone());

        let command = Command::LockAcquire {
            resource: resource.to_string(),
            client: client.to_string(),
            mode,
        };
        let index = match self.propose_leader(&command).await {
            Ok(index) => index,
            Err(e) => {
                self.clear_grant_waiters(&key);
                return Err(e);
            }
        };

        match self.wait_applied(index, deadline).await? {
            Outcome::AcquireGranted => {
                self.clear_grant_waiters(&key);
                Ok(())
            }
            Outcome::AcquireQueued => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, grant_rx).await {
                    Ok(Ok(GrantResult::Granted)) => Ok(()),
                    Ok(Ok(GrantResult::Aborted)) => Err(ClientError::AbortedDeadlock),
                    Ok(Err(_)) => Err(ClientError::Internal("grant channel closed".into())),
                    Err(_) => {
                        // Deadline expired while queued: cancel the request.
                        self.clear_grant_waiters(&key);
                        let _ = self
                            .propose_leader(&Command::LockRelease {
                                resource: resource.to_string(),
                                client: client.to_string(),
                            })
                            .await;
                        Err(ClientError::Timeout)
                    }
                }
            }
            other => Err(ClientError::Internal(format!(
                "unexpected acquire outcome: {other:?}"
            ))),
        }
    }

    /// `Lock.Release`: ok (also for cancelling a queued request) or
    /// notHolder.
    pub async fn lock_release(&self, resource: &str, client: &str) -> Result<(), ClientError> {
        let index = self
            .propose_leader(&Command::LockRelease {
                resource: resource.to_string(),
                client: client.to_string(),
            })
            .await?;

        match self.wait_applied(index, Instant::now() + APPLY_WAIT).await? {
            Outcome::ReleaseOk | Outcome::ReleaseCancelled => Ok(()),
            Outcome::ReleaseNotHolder => Err(ClientError::NotHolder),
            other => Err(ClientError::Internal(format!(
                "unexpected release outcome: {other:?}"
            ))),
        }
    }

    /// `Lock.Inspect`: locally-applied snapshot of the lock table.
    pub fn lock_inspect(&self) -> Vec<LockInfo> {
        self.dispatcher.lock_inspect()
    }

    /// `Queue.Enqueue`: route to the queue's primary, which assigns the id
    /// and proposes.
    pub async fn queue_enqueue(&self, queue: &str, payload: Bytes) -> Result<Uuid, ClientError> {
        let primary = self.primary_for(queue);
        if primary == self.node_id {
            self.enqueue_local(queue, payload).await
        } else {
            let rpc = ClientRpc::Enqueue {
                queue: queue.to_string(),
                payload,
            };
            match self.forward_client_rpc(&primary, &rpc).await? {
                ClientRpcReply::Enqueued { message_id } => Ok(message_id),
                reply => Err(reply_to_error(reply)),
            }
        }
    }

    /// `Queue.Dequeue`: primary reserves the head pending message.
    pub async fn queue_dequeue(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, ClientError> {
        let primary = self.primary_for(queue);
        if primary == self.node_id {
            self.dequeue_local(queue, consumer, visibility).await
        } else {
            let rpc = ClientRpc::Dequeue {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                visibility_ms: visibility.as_millis() as u64,
            };
            match self.forward_client_rpc(&primary, &rpc).await? {
                ClientRpcReply::Dequeued(delivery) => Ok(delivery),
                reply => Err(reply_to_error(reply)),
            }
        }
    }

    /// `Queue.Ack`: settle a delivered message for good.
    pub async fn queue_ack(&self, message_id: Uuid) -> Result<(), ClientError> {
        let index = self
            .propose_leader(&Command::QueueAck { message_id })
            .await?;
        match self.wait_applied(index, Instant::now() + APPLY_WAIT).await? {
            Outcome::AckOk => Ok(()),
            Outcome::AckUnknown => Err(ClientError::UnknownMessage(message_id)),
            other => Err(ClientError::Internal(format!(
                "unexpected ack outcome: {other:?}"
            ))),
        }
    }

    pub fn queue_stats(&self) -> BTreeMap<String, kumo_coord::QueueStats> {
        self.dispatcher.queue_stats()
    }

    /// `Cache.Get`: local hit, else peer probes, else the backing store.
    pub async fn cache_get(&self, key: &str) -> Result<Option<Bytes>, ClientError> {
        if let Some(value) = self.dispatcher.cache_get_local(key) {
            return Ok(Some(value));
        }

        // Probe peers; the first valid holder supplies the value and
        // downgrades itself to Shared.
        let request = CacheReadRequest {
            key: key.to_string(),
        };
        let payload =
            bincode::serialize(&request).map_err(|e| ClientError::Internal(e.to_string()))?;

        for peer in self.detector.live_peers() {
            let envelope = Envelope::new(
                MessageKind::CacheRead,
                self.node_id.clone(),
                Bytes::from(payload.clone()),
            );
            let reply = match self
                .transport
                .request(&peer, envelope, PROBE_TIMEOUT)
                .await
            {
                Ok(reply) => reply,
                Err(_) => continue,
            };
            let Ok(decoded) = bincode::deserialize::<CacheReadReply>(&reply.payload) else {
                continue;
            };
            if let Some(probe) = decoded.reply {
                let evictions = self.dispatcher.cache_fill_shared(key, probe.value.clone());
                self.schedule_evictions(evictions);
                return Ok(Some(probe.value));
            }
        }

        // No peer holds it: the backing store is authoritative; a fill from
        // there with no other holder enters Exclusive.
        if let Some(value) = self.dispatcher.backing_get(key) {
            let evictions = self.dispatcher.cache_fill_exclusive(key, value.clone());
            self.schedule_evictions(evictions);
            return Ok(Some(value));
        }

        Ok(None)
    }

    /// `Cache.Put`: sequenced through the replicated log; on apply the
    /// origin holds M and everyone else drops to I.
    pub async fn cache_put(&self, key: &str, value: Bytes) -> Result<(), ClientError> {
        let index = self
            .propose_leader(&Command::CachePut {
                key: key.to_string(),
                value,
                origin: self.node_id.clone(),
            })
            .await?;
        self.wait_applied(index, Instant::now() + APPLY_WAIT)
            .await?;
        Ok(())
    }

    pub fn cache_stats(&self) -> kumo_coord::CacheStats {
        self.dispatcher.cache_stats()
    }

    /// Local MESI state of a key (absent reads as Invalid).
    pub fn cache_state(&self, key: &str) -> kumo_coord::MesiState {
        self.dispatcher.cache_state(key)
    }

    /// `Cluster.Status`.
    pub fn cluster_status(&self) -> ClusterStatus {
        let status = self.raft.status();
        let peers = self
            .config
            .roster()
            .map(|roster| {
                roster
                    .keys()
                    .filter(|id| **id != self.node_id)
                    .map(|id| PeerStatus {
                        node_id: id.clone(),
                        state: self.detector.state(id),
                        phi: self.detector.phi(id),
                    })
                    .collect()
            })
            .unwrap_or_default();

        ClusterStatus {
            node_id: status.node_id,
            role: status.role,
            term: status.term,
            leader: status.leader,
            commit_index: status.commit_index,
            last_applied: status.last_applied,
            peers,
        }
    }

    // ------------------------------------------------------------------
    // Propose / wait plumbing
    // ------------------------------------------------------------------

    /// Propose a command through the leader (locally or forwarded) and
    /// return its committed log index.
    async fn propose_leader(&self, command: &Command) -> Result<u64, ClientError> {
        let raw = command
            .encode()
            .map_err(|e| ClientError::Internal(e.to_string()))?;

        if self.raft.is_leader() {
            let index = self.raft.propose(raw).await?;
            self.raft.wait_committed(index).await?;
            return Ok(index.as_u64());
        }

        let Some(leader) = self.raft.leader() else {
            return Err(ClientError::LeaderUnknown);
        };
        let rpc = ClientRpc::Propose { command: raw };
        match self.forward_client_rpc(leader.as_str(), &rpc).await? {
            ClientRpcReply::Proposed { index } => Ok(index),
            reply => Err(reply_to_error(reply)),
        }
    }

    async fn forward_client_rpc(
        &self,
        target: &str,
        rpc: &ClientRpc,
    ) -> Result<ClientRpcReply, ClientError> {
        let payload = bincode::serialize(rpc).map_err(|e| ClientError::Internal(e.to_string()))?;
        let envelope = Envelope::new(
            MessageKind::ClientPropose,
            self.node_id.clone(),
            Bytes::from(payload),
        );
        let reply = self
            .transport
            .request(target, envelope, FORWARD_TIMEOUT)
            .await
            .map_err(|e| match e {
                kumo_transport::TransportError::Timeout { .. } => ClientError::Timeout,
                _ => ClientError::LeaderUnknown,
            })?;
        bincode::deserialize(&reply.payload).map_err(|e| ClientError::Internal(e.to_string()))
    }

    /// Wait until this node has applied `index`, then return its outcome.
    async fn wait_applied(&self, index: u64, deadline: Instant) -> Result<Outcome, ClientError> {
        let mut rx = self.applied_tx.subscribe();
        while *rx.borrow() < index {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout);
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ClientError::Internal("apply stream closed".into())),
                Err(_) => return Err(ClientError::Timeout),
            }
        }

        self.outcomes
            .lock()
            .get(&index)
            .cloned()
            .ok_or_else(|| ClientError::Internal(format!("outcome for index {index} evicted")))
    }

    async fn enqueue_local(&self, queue: &str, payload: Bytes) -> Result<Uuid, ClientError> {
        let message_id = Uuid::new_v4();
        let index = self
            .propose_leader(&Command::QueueEnqueue {
                queue: queue.to_string(),
                message_id,
                payload,
                produced_at_ms: now_ms(),
            })
            .await?;
        match self.wait_applied(index, Instant::now() + APPLY_WAIT).await? {
            Outcome::Enqueued(id) => Ok(id),
            other => Err(ClientError::Internal(format!(
                "unexpected enqueue outcome: {other:?}"
            ))),
        }
    }

    async fn dequeue_local(
        &self,
        queue: &str,
        consumer: &str,
        visibility: Duration,
    ) -> Result<Option<Delivery>, ClientError> {
        let Some(head) = self.dispatcher.next_pending(queue) else {
            return Ok(None);
        };

        let index = self
            .propose_leader(&Command::QueueReserve {
                message_id: head.id,
                consumer: consumer.to_string(),
                visible_at_ms: now_ms() + visibility.as_millis() as u64,
            })
            .await?;

        match self.wait_applied(index, Instant::now() + APPLY_WAIT).await? {
            Outcome::Reserved(delivery) => Ok(Some(delivery)),
            // Lost a race with another consumer or a sweep; nothing for us.
            Outcome::ReserveRejected => Ok(None),
            other => Err(ClientError::Internal(format!(
                "unexpected reserve outcome: {other:?}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    fn live_ring(&self) -> HashRing {
        let mut nodes = self.detector.live_peers();
        nodes.push(self.node_id.clone());
        HashRing::from_nodes(nodes)
    }

    fn primary_for(&self, queue: &str) -> String {
        self.live_ring()
            .primary(queue)
            .unwrap_or(self.node_id.as_str())
            .to_string()
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn recv_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let envelope = tokio::select! {
                result = self.transport.recv() => match result {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            // Any traffic from a peer proves liveness.
            self.detector.observe(&envelope.sender);

            match envelope.kind {
                MessageKind::Heartbeat => {}
                MessageKind::RequestVote => self.clone().dispatch_vote(envelope),
                MessageKind::AppendEntries => self.clone().dispatch_append(envelope),
                MessageKind::ClientPropose => {
                    let node = self.clone();
                    tokio::spawn(async move { node.serve_client_rpc(envelope).await });
                }
                MessageKind::CacheRead => {
                    let node = self.clone();
                    tokio::spawn(async move { node.serve_cache_probe(envelope).await });
                }
                MessageKind::CacheInvalidate => {
                    if let Ok(hint) =
                        bincode::deserialize::<CacheInvalidateHint>(&envelope.payload)
                    {
                        self.dispatcher.cache_drop_if_clean(&hint.key);
                    }
                }
                // Reply kinds are routed to pending requests inside the
                // transport and never surface here.
                other => {
                    tracing::warn!(kind = ?other, sender = %envelope.sender, "unexpected message kind");
                }
            }
        }
    }

    fn dispatch_vote(self: Arc<Self>, envelope: Envelope) {
        let Ok(request) = bincode::deserialize(&envelope.payload) else {
            tracing::warn!(sender = %envelope.sender, "undecodable RequestVote");
            return;
        };
        let (response_tx, response_rx) = oneshot::channel();
        let rpc_tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            if rpc_tx
                .send(RpcMessage::RequestVote {
                    request,
                    response_tx,
                })
                .await
                .is_err()
            {
                return;
            }
            if let Ok(response) = response_rx.await {
                if let Ok(payload) = bincode::serialize(&response) {
                    let reply = envelope.reply_to(
                        MessageKind::RequestVoteReply,
                        self.node_id.clone(),
                        Bytes::from(payload),
                    );
                    let _ = self.transport.send(&envelope.sender, reply).await;
                }
            }
        });
    }

    fn dispatch_append(self: Arc<Self>, envelope: Envelope) {
        let Ok(request) = bincode::deserialize(&envelope.payload) else {
            tracing::warn!(sender = %envelope.sender, "undecodable AppendEntries");
            return;
        };
        let (response_tx, response_rx) = oneshot::channel();
        let rpc_tx = self.rpc_tx.clone();
        tokio::spawn(async move {
            if rpc_tx
                .send(RpcMessage::AppendEntries {
                    request,
                    response_tx,
                })
                .await
                .is_err()
            {
                return;
            }
            if let Ok(response) = response_rx.await {
                if let Ok(payload) = bincode::serialize(&response) {
                    let reply = envelope.reply_to(
                        MessageKind::AppendEntriesReply,
                        self.node_id.clone(),
                        Bytes::from(payload),
                    );
                    let _ = self.transport.send(&envelope.sender, reply).await;
                }
            }
        });
    }

    async fn serve_client_rpc(self: Arc<Self>, envelope: Envelope) {
        let reply = match bincode::deserialize::<ClientRpc>(&envelope.payload) {
            Ok(ClientRpc::Propose { command }) => self.serve_forwarded_propose(command).await,
            Ok(ClientRpc::Enqueue { queue, payload }) => {
                match self.enqueue_local(&queue, payload).await {
                    Ok(message_id) => ClientRpcReply::Enqueued { message_id },
                    Err(e) => error_to_reply(e),
                }
            }
            Ok(ClientRpc::Dequeue {
                queue,
                consumer,
                visibility_ms,
            }) => {
                match self
                    .dequeue_local(&queue, &consumer, Duration::from_millis(visibility_ms))
                    .await
                {
                    Ok(delivery) => ClientRpcReply::Dequeued(delivery),
                    Err(e) => error_to_reply(e),
                }
            }
            Err(e) => ClientRpcReply::Failed {
                reason: format!("undecodable client rpc: {e}"),
            },
        };

        if let Ok(payload) = bincode::serialize(&reply) {
            let out = envelope.reply_to(
                MessageKind::ClientProposeReply,
                self.node_id.clone(),
                Bytes::from(payload),
            );
            let _ = self.transport.send(&envelope.sender, out).await;
        }
    }

    async fn serve_forwarded_propose(&self, command: Bytes) -> ClientRpcReply {
        if !self.raft.is_leader() {
            return match self.raft.leader() {
                Some(leader) if leader.as_str() != self.node_id => ClientRpcReply::NotLeader {
                    hint: Some(leader.0),
                },
                _ => ClientRpcReply::LeaderUnknown,
            };
        }
        match self.raft.propose(command).await {
            Ok(index) => match self.raft.wait_committed(index).await {
                Ok(()) => ClientRpcReply::Proposed {
                    index: index.as_u64(),
                },
                Err(kumo_raft::RaftError::CommitTimeout { .. }) => ClientRpcReply::Timeout,
                Err(e) => ClientRpcReply::Failed {
                    reason: e.to_string(),
                },
            },
            Err(kumo_raft::RaftError::NotLeader { leader }) => ClientRpcReply::NotLeader {
                hint: leader.map(|l| l.0),
            },
            Err(e) => ClientRpcReply::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn serve_cache_probe(self: Arc<Self>, envelope: Envelope) {
        let Ok(request) = bincode::deserialize::<CacheReadRequest>(&envelope.payload) else {
            return;
        };
        let reply = CacheReadReply {
            reply: self.dispatcher.cache_probe(&request.key),
        };
        if let Ok(payload) = bincode::serialize(&reply) {
            let out = envelope.reply_to(
                MessageKind::CacheReadReply,
                self.node_id.clone(),
                Bytes::from(payload),
            );
            let _ = self.transport.send(&envelope.sender, out).await;
        }
    }

    /// Drain committed entries into the dispatcher.
    async fn apply_task(
        self: Arc<Self>,
        mut applied_rx: tokio::sync::mpsc::Receiver<(kumo_raft::LogIndex, Bytes)>,
    ) {
        while let Some((index, raw)) = applied_rx.recv().await {
            let index = index.as_u64();
            match self.dispatcher.apply(index, &raw) {
                Ok(applied) => {
                    let outcome = self.process_applied(&applied);
                    let mut outcomes = self.outcomes.lock();
                    outcomes.insert(index, outcome);
                    while outcomes
                        .keys()
                        .next()
                        .map_or(false, |first| index.saturating_sub(*first) >= OUTCOME_WINDOW)
                    {
                        outcomes.pop_first();
                    }
                    drop(outcomes);
                    let _ = self.applied_tx.send(index);
                }
                Err(e) => {
                    // A log entry this replica cannot decode means the
                    // replicas no longer agree; stopping is the only safe
                    // move.
                    tracing::error!(error = %e, index, "state machine apply failed");
                    let _ = self.fatal_tx.send(Some(e.to_string()));
                    break;
                }
            }
        }
    }

    /// Translate an apply result into the condensed outcome and fire the
    /// side effects (grant waiters, eviction write-backs, invalidate hints).
    fn process_applied(&self, applied: &Applied) -> Outcome {
        match applied {
            Applied::LockAcquire {
                resource,
                client,
                outcome,
            } => match outcome {
                AcquireApplied::Granted => {
                    self.resolve_grant(resource, client, GrantResult::Granted);
                    Outcome::AcquireGranted
                }
                AcquireApplied::Queued => Outcome::AcquireQueued,
            },
            Applied::LockRelease { outcome, resource, .. } => match outcome {
                ReleaseApplied::Released { granted } => {
                    for waiter in granted {
                        self.resolve_grant(resource, &waiter.client, GrantResult::Granted);
                    }
                    Outcome::ReleaseOk
                }
                ReleaseApplied::Cancelled => Outcome::ReleaseCancelled,
                ReleaseApplied::NotHolder => Outcome::ReleaseNotHolder,
            },
            Applied::LockAbort { client, outcome } => {
                for resource in &outcome.cancelled {
                    self.resolve_grant(resource, client, GrantResult::Aborted);
                }
                for (resource, waiter) in &outcome.granted {
                    self.resolve_grant(resource, &waiter.client, GrantResult::Granted);
                }
                Outcome::Other
            }
            Applied::Queue(applied) => match applied {
                QueueApplied::Enqueued { message_id, .. } => Outcome::Enqueued(*message_id),
                QueueApplied::EnqueueIgnored { message_id } => Outcome::Enqueued(*message_id),
                QueueApplied::Reserved(message) => Outcome::Reserved(Delivery {
                    message_id: message.id,
                    payload: message.payload.clone(),
                    attempts: message.attempts,
                }),
                QueueApplied::ReserveRejected { .. } => Outcome::ReserveRejected,
                QueueApplied::Acked { .. } => Outcome::AckOk,
                QueueApplied::AckUnknown { .. } => Outcome::AckUnknown,
                QueueApplied::Returned { .. }
                | QueueApplied::ReturnIgnored { .. }
                | QueueApplied::Deadlettered { .. }
                | QueueApplied::DeadIgnored { .. } => Outcome::Other,
            },
            Applied::CachePut {
                key,
                origin,
                evictions,
            } => {
                if *origin == self.node_id {
                    self.schedule_evictions(evictions.clone());
                    self.broadcast_invalidate_hint(key);
                }
                Outcome::Other
            }
            Applied::CacheInvalidate { .. } | Applied::CacheEvict { .. } => Outcome::Other,
        }
    }

    fn register_grant_waiter(&self, key: GrantKey) -> oneshot::Receiver<GrantResult> {
        let (tx, rx) = oneshot::channel();
        self.grant_waiters.lock().entry(key).or_default().push(tx);
        rx
    }

    fn clear_grant_waiters(&self, key: &GrantKey) {
        self.grant_waiters.lock().remove(key);
    }

    fn resolve_grant(&self, resource: &str, client: &str, result: GrantResult) {
        let key = (resource.to_string(), client.to_string());
        if let Some(waiters) = self.grant_waiters.lock().remove(&key) {
            for tx in waiters {
                let _ = tx.send(result);
            }
        }
    }

    /// Write-back evictions must go through the log; dirty values are not
    /// allowed to vanish with a local eviction.
    fn schedule_evictions(&self, evictions: Vec<kumo_coord::Eviction>) {
        for eviction in evictions {
            if eviction.writeback.is_none() {
                continue;
            }
            let Some(node) = self.handle() else { return };
            tokio::spawn(async move {
                let command = Command::CacheEvict {
                    key: eviction.key.clone(),
                    value: eviction.writeback,
                    origin: node.node_id.clone(),
                };
                if let Err(e) = node.propose_leader(&command).await {
                    tracing::warn!(error = %e, key = %eviction.key, "eviction write-back failed");
                }
            });
        }
    }

    fn broadcast_invalidate_hint(&self, key: &str) {
        let hint = CacheInvalidateHint {
            key: key.to_string(),
        };
        let Ok(payload) = bincode::serialize(&hint) else {
            return;
        };
        let Some(node) = self.handle() else { return };
        tokio::spawn(async move {
            let envelope = Envelope::new(
                MessageKind::CacheInvalidate,
                node.node_id.clone(),
                Bytes::from(payload),
            );
            node.transport.broadcast(envelope).await;
        });
    }

    /// Leader-only: rebuild the wait-for graph and abort one victim per
    /// cycle.
    async fn deadlock_scanner(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.deadlock_scan_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }
            if !self.raft.is_leader() {
                continue;
            }

            let edges = self.dispatcher.wait_for_edges();
            if edges.is_empty() {
                continue;
            }
            let ages = self.dispatcher.waiter_ages();
            for victim in deadlock::victims(&edges, &ages) {
                tracing::warn!(client = %victim, "aborting deadlock victim");
                if let Err(e) = self
                    .propose_leader(&Command::LockAbort {
                        client: victim.clone(),
                    })
                    .await
                {
                    tracing::warn!(error = %e, client = %victim, "deadlock abort failed");
                }
            }
        }
    }

    /// Primary-only: return expired inflight messages to pending, or
    /// dead-letter them once retries are exhausted.
    async fn visibility_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            let now = now_ms();
            for (message_id, attempts) in self.dispatcher.expired_inflight(now) {
                let Some(message) = self.dispatcher.message(message_id) else {
                    continue;
                };
                if self.primary_for(&message.queue) != self.node_id {
                    continue;
                }

                let command = if attempts > self.config.queue_max_retries {
                    Command::QueueDead { message_id }
                } else {
                    Command::QueueReturn { message_id }
                };
                if let Err(e) = self.propose_leader(&command).await {
                    tracing::debug!(error = %e, %message_id, "sweep proposal failed");
                }
            }
        }
    }

    /// Queue handover on membership transitions: when a queue's primary
    /// moves off this node, re-propose its inflight messages as returns so
    /// the new primary sees them pending. The handover rides the log, never
    /// a side channel.
    async fn rebalancer(self: Arc<Self>) {
        let mut events = self.detector.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut previous = self.live_ring();

        loop {
            tokio::select! {
                event = events.recv() => {
                    if event.is_err() {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }

            let current = self.live_ring();
            for queue in self.dispatcher.queue_names() {
                if queue == DEAD_LETTER_QUEUE {
                    continue;
                }
                let was_ours = previous.is_primary(&queue, &self.node_id);
                let still_ours = current.is_primary(&queue, &self.node_id);
                if was_ours && !still_ours {
                    for message_id in self.dispatcher.inflight(&queue) {
                        tracing::info!(%message_id, queue = %queue, "handing over inflight message");
                        if let Err(e) = self
                            .propose_leader(&Command::QueueReturn { message_id })
                            .await
                        {
                            tracing::warn!(error = %e, %message_id, "handover proposal failed");
                        }
                    }
                }
            }
            previous = current;
        }
    }
}

fn reply_to_error(reply: ClientRpcReply) -> ClientError {
    match reply {
        ClientRpcReply::NotLeader { hint } => ClientError::NotLeader { hint },
        ClientRpcReply::LeaderUnknown => ClientError::LeaderUnknown,
        ClientRpcReply::Timeout => ClientError::Timeout,
        ClientRpcReply::Failed { reason } => ClientError::Internal(reason),
        other => ClientError::Internal(format!("unexpected reply: {other:?}")),
    }
}

fn error_to_reply(error: ClientError) -> ClientRpcReply {
    match error {
        ClientError::NotLeader { hint } => ClientRpcReply::NotLeader { hint },
        ClientError::LeaderUnknown => ClientRpcReply::LeaderUnknown,
        ClientError::Timeout => ClientRpcReply::Timeout,
        other => ClientRpcReply::Failed {
            reason: other.to_string(),
        },
    }
}
