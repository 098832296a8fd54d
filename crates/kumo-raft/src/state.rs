//! Raft node state and RPC handlers.
//!
//! # Persistent state (survives restart)
//!
//! - `current_term`, `voted_for`: in [`HardState`], rewritten + fsynced
//!   before any reply that depends on them
//! - the log itself: [`RaftLog`]
//!
//! # Volatile state
//!
//! - `commit_index`, `last_applied`, current role and known leader
//! - on leaders: `next_index[peer]`, `match_index[peer]`

use crate::config::RaftConfig;
use crate::error::Result;
use crate::hard_state::{HardState, HardStateFile};
use crate::log::RaftLog;
use crate::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};

/// Volatile per-node state.
pub struct VolatileState {
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_state: Option<LeaderState>,
    pub last_heartbeat: Instant,
}

/// Leader-only replication bookkeeping.
pub struct LeaderState {
    /// Next log index to send to each follower.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each follower.
    pub match_index: HashMap<NodeId, LogIndex>,
}

/// All Raft state for one node, shared between the background loops.
pub struct RaftState {
    node_id: NodeId,
    config: RaftConfig,
    roster: Vec<NodeId>,
    hard: RwLock<HardState>,
    hard_file: HardStateFile,
    volatile: RwLock<VolatileState>,
    log: RaftLog,
    /// Wakes `wait_committed` callers and the applier.
    commit_tx: watch::Sender<u64>,
    /// Nudges the replication loop after a propose.
    pub(crate) replicate_kick: Notify,
}

impl RaftState {
    pub fn new(
        node_id: NodeId,
        config: RaftConfig,
        roster: Vec<NodeId>,
        log: RaftLog,
        hard_file: HardStateFile,
        hard: HardState,
    ) -> Arc<Self> {
        let (commit_tx, _) = watch::channel(0);
        Arc::new(Self {
            node_id,
            config,
            roster,
            hard: RwLock::new(hard),
            hard_file,
            volatile: RwLock::new(VolatileState {
                role: Role::Follower,
                leader_id: None,
                commit_index: LogIndex::ZERO,
                last_applied: LogIndex::ZERO,
                leader_state: None,
                last_heartbeat: Instant::now(),
            }),
            log,
            commit_tx,
            replicate_kick: Notify::new(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Full static roster, including this node.
    pub fn roster(&self) -> &[NodeId] {
        &self.roster
    }

    /// Peers: the roster minus this node.
    pub fn peers(&self) -> Vec<NodeId> {
        self.roster
            .iter()
            .filter(|n| *n != &self.node_id)
            .cloned()
            .collect()
    }

    pub fn role(&self) -> Role {
        self.volatile.read().role
    }

    pub fn current_term(&self) -> Term {
        self.hard.read().current_term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.volatile.read().leader_id.clone()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    pub fn log_ref(&self) -> &RaftLog {
        &self.log
    }

    pub fn volatile_state(&self) -> &RwLock<VolatileState> {
        &self.volatile
    }

    /// Watch channel carrying the commit index as a bare u64.
    pub fn commit_watch(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    pub(crate) fn set_commit_index(&self, volatile: &mut VolatileState, index: LogIndex) {
        if index > volatile.commit_index {
            volatile.commit_index = index;
            let _ = self.commit_tx.send(index.as_u64());
        }
    }

    /// Handle RequestVote. The grant condition:
    /// candidate term >= ours, no conflicting vote this term, and the
    /// candidate's log at least as up-to-date as ours. A granted vote is
    /// persisted before this returns.
    pub fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();

        let mut hard = self.hard.write();
        let mut volatile = self.volatile.write();

        if request.term > hard.current_term {
            self.step_down_inner(&mut hard, &mut volatile, request.term)?;
        }

        let mut vote_granted = false;

        if request.term >= hard.current_term {
            let conflicting_vote = hard
                .voted_for
                .as_ref()
                .map_or(false, |id| id != &request.candidate_id);

            if !conflicting_vote {
                let log_ok = request.last_log_term > last_log_term
                    || (request.last_log_term == last_log_term
                        && request.last_log_index >= last_log_index);

                if log_ok {
                    vote_granted = true;
                    hard.voted_for = Some(request.candidate_id.clone());
                    self.hard_file.save(&hard)?;
                    volatile.last_heartbeat = Instant::now();
                }
            }
        }

        tracing::debug!(
            candidate = %request.candidate_id,
            term = %request.term,
            granted = vote_granted,
            "vote request handled"
        );

        Ok(RequestVoteResponse {
            term: hard.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries: heartbeat acceptance, consistency check,
    /// conflict truncation, append + fsync, commit-index advance.
    pub fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (current_term, rejected_stale) = {
            let mut hard = self.hard.write();
            let mut volatile = self.volatile.write();

            if request.term > hard.current_term {
                self.step_down_inner(&mut hard, &mut volatile, request.term)?;
            }

            let rejected_stale = request.term < hard.current_term;

            if !rejected_stale {
                volatile.last_heartbeat = Instant::now();
                volatile.leader_id = Some(request.leader_id.clone());

                // Another leader with our term (or newer) exists; a candidate
                // or stale leader must fall back to follower.
                if volatile.role != Role::Follower {
                    if volatile.role == Role::Leader {
                        tracing::warn!(
                            term = %hard.current_term,
                            leader = %request.leader_id,
                            "stepping down: AppendEntries from another leader"
                        );
                    }
                    volatile.role = Role::Follower;
                    volatile.leader_state = None;
                }
            }

            (hard.current_term, rejected_stale)
        };

        if rejected_stale {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: None,
                last_log_index: self.log.last_index(),
            });
        }

        // Consistency check: our log must contain prev_log_index with the
        // matching term.
        let log_ok = match self.log.term_at(request.prev_log_index) {
            Some(term) => term == request.prev_log_term,
            None => false,
        };

        if !log_ok {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_index: request.prev_log_index.prev(),
                last_log_index: self.log.last_index(),
            });
        }

        if !request.entries.is_empty() {
            // Truncate a conflicting suffix, then append. Entries we already
            // hold with the same (term, index) are rewritten identically, so
            // re-truncating from prev+1 is safe and simple.
            let first_new = request.prev_log_index.next();
            self.log.truncate(first_new)?;
            self.log.append_batch(request.entries)?;
        }

        let last_new_index = self.log.last_index();
        {
            let mut volatile = self.volatile.write();
            if request.leader_commit > volatile.commit_index {
                let bounded = std::cmp::min(request.leader_commit, last_new_index);
                self.set_commit_index(&mut volatile, bounded);
            }
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
            last_log_index: last_new_index,
        })
    }

    /// Revert to follower at `new_term`, clearing the vote. Persists.
    fn step_down_inner(
        &self,
        hard: &mut HardState,
        volatile: &mut VolatileState,
        new_term: Term,
    ) -> Result<()> {
        hard.current_term = new_term;
        hard.voted_for = None;
        self.hard_file.save(hard)?;
        volatile.role = Role::Follower;
        volatile.leader_state = None;
        volatile.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Become candidate: bump term, vote for self (persisted), reset timer.
    /// Returns the election term.
    pub fn start_election(&self) -> Result<Term> {
        let mut hard = self.hard.write();
        let mut volatile = self.volatile.write();

        hard.current_term = hard.current_term.next();
        hard.voted_for = Some(self.node_id.clone());
        self.hard_file.save(&hard)?;

        volatile.role = Role::Candidate;
        volatile.leader_state = None;
        volatile.last_heartbeat = Instant::now();

        Ok(hard.current_term)
    }

    /// Become leader after winning: init next/match indexes.
    pub fn become_leader(&self) -> Result<()> {
        let last_log_index = self.log.last_index();

        let mut volatile = self.volatile.write();
        if volatile.role != Role::Candidate {
            // Lost the race while counting votes.
            return Ok(());
        }
        volatile.role = Role::Leader;
        volatile.leader_id = Some(self.node_id.clone());

        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for node in &self.roster {
            if node != &self.node_id {
                next_index.insert(node.clone(), last_log_index.next());
                match_index.insert(node.clone(), LogIndex::ZERO);
            }
        }
        volatile.leader_state = Some(LeaderState {
            next_index,
            match_index,
        });

        tracing::info!(term = %self.current_term(), node = %self.node_id, "became leader");
        Ok(())
    }

    /// Whether the randomized election timeout has elapsed without leader
    /// contact. Leaders never time out.
    pub fn election_timeout_elapsed(&self, timeout: std::time::Duration) -> bool {
        let volatile = self.volatile.read();
        if volatile.role == Role::Leader {
            return false;
        }
        volatile.last_heartbeat.elapsed() > timeout
    }

    /// Observed a higher term in a response: step down.
    pub fn observe_term(&self, term: Term) -> Result<()> {
        let mut hard = self.hard.write();
        if term > hard.current_term {
            let mut volatile = self.volatile.write();
            self.step_down_inner(&mut hard, &mut volatile, term)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn set_current_term(&self, term: Term) {
        self.hard.write().current_term = term;
    }

    #[cfg(test)]
    pub fn force_candidate(&self) {
        self.volatile.write().role = Role::Candidate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn test_state() -> (Arc<RaftState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(dir.path()).unwrap();
        let (hard_file, hard) = HardStateFile::load(dir.path()).unwrap();

        let roster = vec![NodeId::new("n1"), NodeId::new("n2"), NodeId::new("n3")];
        let state = RaftState::new(
            NodeId::new("n1"),
            RaftConfig::default(),
            roster,
            log,
            hard_file,
            hard,
        );
        (state, dir)
    }

    #[test]
    fn initial_state_is_follower() {
        let (state, _dir) = test_state();
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term::ZERO);
        assert_eq!(state.leader(), None);
        assert_eq!(state.peers().len(), 2);
    }

    #[test]
    fn grants_vote_to_up_to_date_candidate() {
        let (state, _dir) = test_state();

        let response = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(1),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .unwrap();

        assert!(response.vote_granted);
        assert_eq!(response.term, Term(1));
    }

    #[test]
    fn rejects_vote_for_stale_term() {
        let (state, _dir) = test_state();
        state.set_current_term(Term(10));

        let response = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(5),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .unwrap();

        assert!(!response.vote_granted);
        assert_eq!(response.term, Term(10));
    }

    #[test]
    fn one_vote_per_term() {
        let (state, _dir) = test_state();

        let first = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(1),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .unwrap();
        assert!(first.vote_granted);

        // A different candidate in the same term is refused...
        let second = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(1),
                candidate_id: NodeId::new("n3"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .unwrap();
        assert!(!second.vote_granted);

        // ...but the same candidate asking again is re-granted.
        let again = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(1),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .unwrap();
        assert!(again.vote_granted);
    }

    #[test]
    fn denies_vote_to_stale_log() {
        let (state, _dir) = test_state();
        state
            .log_ref()
            .append(LogEntry::new(Term(2), LogIndex(1), Bytes::from("x")))
            .unwrap();
        state.set_current_term(Term(2));

        // Candidate's last log term is older than ours.
        let response = state
            .handle_request_vote(RequestVoteRequest {
                term: Term(3),
                candidate_id: NodeId::new("n2"),
                last_log_index: LogIndex(5),
                last_log_term: Term(1),
            })
            .unwrap();
        assert!(!response.vote_granted);
    }

    #[test]
    fn append_entries_accepts_and_commits() {
        let (state, _dir) = test_state();
        state.set_current_term(Term(1));

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(1),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![
                    LogEntry::new(Term(1), LogIndex(1), Bytes::from("a")),
                    LogEntry::new(Term(1), LogIndex(2), Bytes::from("b")),
                ],
                leader_commit: LogIndex(1),
            })
            .unwrap();

        assert!(response.success);
        assert_eq!(response.last_log_index, LogIndex(2));
        assert_eq!(state.commit_index(), LogIndex(1));
        assert_eq!(state.leader(), Some(NodeId::new("n2")));
    }

    #[test]
    fn append_entries_rejects_gap() {
        let (state, _dir) = test_state();
        state.set_current_term(Term(1));

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(1),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex(5),
                prev_log_term: Term(1),
                entries: vec![LogEntry::new(Term(1), LogIndex(6), Bytes::from("x"))],
                leader_commit: LogIndex::ZERO,
            })
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(LogIndex(4)));
    }

    #[test]
    fn append_entries_truncates_conflicting_suffix() {
        let (state, _dir) = test_state();
        state.set_current_term(Term(2));
        state
            .log_ref()
            .append_batch(vec![
                LogEntry::new(Term(1), LogIndex(1), Bytes::from("a")),
                LogEntry::new(Term(1), LogIndex(2), Bytes::from("stale")),
            ])
            .unwrap();

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term: Term(2),
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex(1),
                prev_log_term: Term(1),
                entries: vec![LogEntry::new(Term(2), LogIndex(2), Bytes::from("fresh"))],
                leader_commit: LogIndex::ZERO,
            })
            .unwrap();

        assert!(response.success);
        let entry = state.log_ref().get(LogIndex(2)).unwrap();
        assert_eq!(entry.term, Term(2));
        assert_eq!(entry.command, Bytes::from("fresh"));
    }

    #[test]
    fn candidate_steps_down_on_current_leader() {
        let (state, _dir) = test_state();
        state.start_election().unwrap();
        assert_eq!(state.role(), Role::Candidate);
        let term = state.current_term();

        let response = state
            .handle_append_entries(AppendEntriesRequest {
                term,
                leader_id: NodeId::new("n2"),
                prev_log_index: LogIndex::ZERO,
                prev_log_term: Term::ZERO,
                entries: vec![],
                leader_commit: LogIndex::ZERO,
            })
            .unwrap();

        assert!(response.success);
        assert_eq!(state.role(), Role::Follower);
    }

    #[test]
    fn start_election_bumps_and_persists_term() {
        let (state, dir) = test_state();
        let term = state.start_election().unwrap();
        assert_eq!(term, Term(1));
        assert_eq!(state.role(), Role::Candidate);

        let (_, reloaded) = HardStateFile::load(dir.path()).unwrap();
        assert_eq!(reloaded.current_term, Term(1));
        assert_eq!(reloaded.voted_for, Some(NodeId::new("n1")));
    }
}
