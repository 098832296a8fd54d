//! The consensus façade: wires state, timer, and background loops together.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::hard_state::HardStateFile;
use crate::log::{RaftLog, RecoveryInfo};
use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use crate::ReplicatedLog;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};

/// Snapshot of this node's consensus view, for status endpoints.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_len: usize,
}

/// One node's consensus instance.
///
/// Owns the background tasks (election timer, election loop, heartbeat /
/// replication loop, apply loop, rpc dispatch) and exposes the single
/// linearizable primitive the services build on: propose a command, wait
/// for it to commit, observe it in the apply stream.
pub struct Raft {
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    election_timer: Arc<ElectionTimer>,
    shutdown_tx: broadcast::Sender<()>,
    applied_tx: mpsc::Sender<(LogIndex, Bytes)>,
    applied_rx: parking_lot::Mutex<Option<mpsc::Receiver<(LogIndex, Bytes)>>>,
    rpc_rx: parking_lot::Mutex<Option<RpcReceiver>>,
    fatal_tx: watch::Sender<Option<String>>,
}

impl Raft {
    /// Open persistent state under `dir` and assemble the node.
    ///
    /// `roster` is the full static cluster membership including this node.
    /// `rpc_rx` is the inbox of incoming consensus RPCs; pass `None` only in
    /// single-purpose tests that drive handlers directly.
    pub fn open(
        node_id: NodeId,
        config: RaftConfig,
        roster: Vec<NodeId>,
        dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: Option<RpcReceiver>,
    ) -> Result<(Self, RecoveryInfo)> {
        let dir = dir.as_ref();
        let (log, recovery) = RaftLog::open(dir)?;
        let (hard_file, hard) = HardStateFile::load(dir)?;

        if recovery.entries_recovered > 0 {
            tracing::info!(
                entries = recovery.entries_recovered,
                tail_discarded = recovery.tail_discarded,
                "recovered raft log"
            );
        }

        let state = RaftState::new(node_id, config.clone(), roster, log, hard_file, hard);
        let election_timer = ElectionTimer::new(config.clone());
        let (shutdown_tx, _) = broadcast::channel(16);
        let (applied_tx, applied_rx) = mpsc::channel(1024);
        let (fatal_tx, _) = watch::channel(None);

        Ok((
            Self {
                state,
                config,
                transport,
                election_timer,
                shutdown_tx,
                applied_tx,
                applied_rx: parking_lot::Mutex::new(Some(applied_rx)),
                rpc_rx: parking_lot::Mutex::new(rpc_rx),
                fatal_tx,
            },
            recovery,
        ))
    }

    /// Spawn the background tasks.
    pub fn start(&self) {
        tokio::spawn(self.election_timer.clone().run());

        let timeout_rx = self
            .election_timer
            .take_receiver()
            .expect("election timer receiver already taken");

        tokio::spawn(crate::election::election_loop(
            self.state.clone(),
            self.config.clone(),
            self.transport.clone(),
            timeout_rx,
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(crate::replication::heartbeat_loop(
            self.state.clone(),
            self.config.clone(),
            self.transport.clone(),
            self.shutdown_tx.subscribe(),
        ));

        tokio::spawn(crate::replication::apply_loop(
            self.state.clone(),
            self.applied_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        if let Some(rpc_rx) = self.rpc_rx.lock().take() {
            tokio::spawn(crate::rpc_handler::rpc_handler_loop(
                self.state.clone(),
                rpc_rx,
                self.election_timer.clone(),
                self.fatal_tx.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    /// Stop all background tasks.
    pub fn shutdown(&self) {
        self.election_timer.shutdown();
        let _ = self.shutdown_tx.send(());
    }

    /// Take the stream of applied `(index, command)` pairs. Single consumer:
    /// the state-machine dispatcher.
    pub fn take_applied(&self) -> Option<mpsc::Receiver<(LogIndex, Bytes)>> {
        self.applied_rx.lock().take()
    }

    /// Fatal-error channel: set when durable state can no longer be written
    /// and the node must stop.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Wait until `index` is committed or the propose window closes.
    pub async fn wait_committed(&self, index: LogIndex) -> Result<()> {
        let started = Instant::now();
        let mut commit_rx = self.state.commit_watch();

        loop {
            if *commit_rx.borrow() >= index.as_u64() {
                return Ok(());
            }
            let remaining = self
                .config
                .propose_timeout
                .checked_sub(started.elapsed())
                .ok_or(RaftError::CommitTimeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })?;

            match tokio::time::timeout(remaining, commit_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RaftError::Shutdown),
                Err(_) => {
                    return Err(RaftError::CommitTimeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Current consensus snapshot.
    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.state.node_id().clone(),
            role: self.state.role(),
            term: self.state.current_term(),
            leader: self.state.leader(),
            commit_index: self.state.commit_index(),
            last_applied: self.state.last_applied(),
            log_len: self.state.log_ref().len(),
        }
    }

    /// Direct access for tests and the rpc adapter.
    pub fn state(&self) -> &Arc<RaftState> {
        &self.state
    }
}

#[async_trait::async_trait]
impl ReplicatedLog for Raft {
    /// Append a command to the replicated log.
    ///
    /// Leader-only; returns the index the command will occupy. Replication
    /// is kicked immediately rather than waiting for the next heartbeat.
    async fn propose(&self, command: Bytes) -> Result<LogIndex> {
        if self.state.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.state.leader(),
            });
        }

        let term = self.state.current_term();
        let index = self.state.log_ref().last_index().next();
        self.state
            .log_ref()
            .append(LogEntry::new(term, index, command))?;

        self.election_timer.reset();
        self.state.replicate_kick.notify_one();

        Ok(index)
    }

    fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn solo_raft() -> (Raft, TempDir) {
        let dir = TempDir::new().unwrap();
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(HashMap::new()));
        let (raft, _) = Raft::open(
            NodeId::new("n1"),
            RaftConfig::default(),
            vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")],
            dir.path(),
            transport,
            None,
        )
        .unwrap();
        (raft, dir)
    }

    #[tokio::test]
    async fn propose_refused_off_leader() {
        let (raft, _dir) = solo_raft();
        let err = raft.propose(Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn single_node_quorum_commits_its_own_entries() {
        let dir = TempDir::new().unwrap();
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(HashMap::new()));
        let (raft, _) = Raft::open(
            NodeId::new("n1"),
            RaftConfig::default(),
            vec![NodeId::new("n1")],
            dir.path(),
            transport,
            None,
        )
        .unwrap();
        raft.start();

        // Quorum of one: the election self-elects and entries commit alone.
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        while !raft.is_leader() && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(raft.is_leader());

        let index = raft.propose(Bytes::from("only")).await.unwrap();
        raft.wait_committed(index).await.unwrap();

        let mut applied = raft.take_applied().unwrap();
        let (applied_index, command) = applied.recv().await.unwrap();
        assert_eq!(applied_index, index);
        assert_eq!(command, Bytes::from("only"));

        raft.shutdown();
    }

    #[tokio::test]
    async fn status_reports_initial_view() {
        let (raft, _dir) = solo_raft();
        let status = raft.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.term, Term::ZERO);
        assert_eq!(status.leader, None);
        assert_eq!(status.log_len, 0);
    }

    #[tokio::test]
    async fn restart_preserves_log_and_term() {
        let dir = TempDir::new().unwrap();
        {
            let transport: Arc<dyn RaftTransport> =
                Arc::new(InMemoryTransport::new(HashMap::new()));
            let (raft, _) = Raft::open(
                NodeId::new("n1"),
                RaftConfig::default(),
                vec![NodeId::new("n1")],
                dir.path(),
                transport,
                None,
            )
            .unwrap();
            raft.start();
            let deadline = Instant::now() + std::time::Duration::from_secs(2);
            while !raft.is_leader() && Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            let index = raft.propose(Bytes::from("durable")).await.unwrap();
            raft.wait_committed(index).await.unwrap();
            raft.shutdown();
        }

        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(HashMap::new()));
        let (raft, recovery) = Raft::open(
            NodeId::new("n1"),
            RaftConfig::default(),
            vec![NodeId::new("n1")],
            dir.path(),
            transport,
            None,
        )
        .unwrap();

        assert_eq!(recovery.entries_recovered, 1);
        assert!(raft.status().term >= Term(1));
        assert_eq!(raft.status().log_len, 1);
    }
}
