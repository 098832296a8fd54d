//! Log replication and the apply loop.
//!
//! The leader ships entries from `next_index[follower]` on every heartbeat
//! tick (and immediately after a propose, via the kick signal). Rejections
//! backtrack `next_index` using the follower's conflict hint, falling back
//! to a linear decrement. Commit advances to the highest index replicated on
//! a majority whose entry carries the current term - the current-term rule
//! is what keeps earlier-term entries from being committed by counting.

use crate::config::RaftConfig;
use crate::error::Result;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::interval;

/// Send one AppendEntries round to a single follower and fold the response
/// into next/match bookkeeping. Returns whether the follower is caught up.
pub async fn replicate_to_follower(
    state: Arc<RaftState>,
    follower: &NodeId,
    transport: Arc<dyn RaftTransport>,
) -> Result<bool> {
    let next_idx = {
        let volatile = state.volatile_state().read();
        let Some(leader_state) = volatile.leader_state.as_ref() else {
            return Ok(false); // Lost leadership.
        };
        leader_state
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(LogIndex(1))
    };

    let prev_log_index = next_idx.prev().unwrap_or(LogIndex::ZERO);
    let prev_log_term = state
        .log_ref()
        .term_at(prev_log_index)
        .unwrap_or(Term::ZERO);

    let last_log_index = state.log_ref().last_index();
    let entries = if next_idx <= last_log_index {
        let capped_end = std::cmp::min(
            last_log_index.next(),
            LogIndex(next_idx.as_u64() + state.config().max_entries_per_append as u64),
        );
        state.log_ref().get_range(next_idx, capped_end)
    } else {
        Vec::new() // Pure heartbeat.
    };

    let current_term = state.current_term();
    let request = AppendEntriesRequest {
        term: current_term,
        leader_id: state.node_id().clone(),
        prev_log_index,
        prev_log_term,
        entries: entries.clone(),
        leader_commit: state.commit_index(),
    };

    let response = match tokio::time::timeout(
        state.config().rpc_timeout,
        transport.append_entries(follower, request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        // Lost or slow RPC; the next tick retries.
        Ok(Err(_)) | Err(_) => return Ok(false),
    };

    if response.term > current_term {
        state.observe_term(response.term)?;
        return Ok(false);
    }

    let mut volatile = state.volatile_state().write();
    let Some(leader_state) = volatile.leader_state.as_mut() else {
        return Ok(false);
    };

    if response.success {
        let new_match = if entries.is_empty() {
            prev_log_index
        } else {
            entries.last().map(|e| e.index).unwrap_or(prev_log_index)
        };
        leader_state
            .next_index
            .insert(follower.clone(), new_match.next());
        leader_state.match_index.insert(follower.clone(), new_match);
        Ok(new_match >= last_log_index)
    } else {
        let fallback = next_idx.prev().unwrap_or(LogIndex(1));
        let new_next = response
            .conflict_index
            .map(|c| std::cmp::max(c, LogIndex(1)))
            .unwrap_or(std::cmp::max(fallback, LogIndex(1)));
        leader_state.next_index.insert(follower.clone(), new_next);
        Ok(false)
    }
}

/// Advance the leader's commit index to the highest majority-replicated
/// index whose entry is from the current term.
pub fn advance_commit_index(state: &Arc<RaftState>) -> Result<bool> {
    let current_term = state.current_term();
    let current_commit = state.commit_index();
    let last_log_index = state.log_ref().last_index();

    let match_indices = {
        let volatile = state.volatile_state().read();
        let Some(leader_state) = volatile.leader_state.as_ref() else {
            return Ok(false);
        };
        let mut indices: Vec<LogIndex> = leader_state.match_index.values().copied().collect();
        indices.push(last_log_index); // The leader's own log.
        indices
    };

    let majority = quorum(state.roster().len());

    let mut candidates: Vec<LogIndex> = match_indices
        .iter()
        .filter(|&&idx| idx > current_commit)
        .copied()
        .collect();
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    candidates.dedup();

    for candidate in candidates {
        let replicas = match_indices.iter().filter(|&&idx| idx >= candidate).count();
        if replicas >= majority {
            if state.log_ref().term_at(candidate) == Some(current_term) {
                let mut volatile = state.volatile_state().write();
                state.set_commit_index(&mut volatile, candidate);
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Leader replication loop: ticks at the heartbeat interval, and fires early
/// whenever a propose kicks it.
pub async fn heartbeat_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.replicate_kick.notified() => {}
            _ = shutdown_rx.recv() => {
                tracing::debug!("heartbeat loop shutting down");
                break;
            }
        }

        if state.role() != Role::Leader {
            continue;
        }

        let replications = state.peers().into_iter().map(|follower| {
            let state = state.clone();
            let transport = transport.clone();
            async move { replicate_to_follower(state, &follower, transport).await }
        });
        let _ = futures::future::join_all(replications).await;

        if let Err(e) = advance_commit_index(&state) {
            tracing::error!(error = %e, "commit advance failed");
            if e.is_fatal() {
                break;
            }
        }
    }
}

/// Apply loop: walks `last_applied` toward `commit_index`, forwarding each
/// committed entry in log order to the state-machine channel. The channel
/// send is the only suspension point; `last_applied` advances only after the
/// consumer has accepted the entry.
pub async fn apply_loop(
    state: Arc<RaftState>,
    applied_tx: tokio::sync::mpsc::Sender<(LogIndex, Bytes)>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut commit_rx = state.commit_watch();

    loop {
        let (last_applied, commit_index) = {
            let volatile = state.volatile_state().read();
            (volatile.last_applied, volatile.commit_index)
        };

        if commit_index > last_applied {
            let entries = state
                .log_ref()
                .get_range(last_applied.next(), commit_index.next());
            for entry in entries {
                if applied_tx.send((entry.index, entry.command)).await.is_err() {
                    tracing::debug!("apply consumer gone, stopping apply loop");
                    return;
                }
                state.volatile_state().write().last_applied = entry.index;
            }
            continue;
        }

        tokio::select! {
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("apply loop shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hard_state::HardStateFile;
    use crate::log::RaftLog;
    use tempfile::TempDir;

    fn leader_state() -> (Arc<RaftState>, TempDir) {
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
        state.set_current_term(Term(1));
        state.force_candidate();
        state.become_leader().unwrap();
        (state, dir)
    }

    fn set_match(state: &Arc<RaftState>, peer: &str, index: u64) {
        let mut volatile = state.volatile_state().write();
        volatile
            .leader_state
            .as_mut()
            .unwrap()
            .match_index
            .insert(NodeId::new(peer), LogIndex(index));
    }

    #[tokio::test]
    async fn commit_advances_with_majority() {
        let (state, _dir) = leader_state();

        for i in 1..=5 {
            state
                .log_ref()
                .append(LogEntry::new(Term(1), LogIndex(i), Bytes::from("cmd")))
                .unwrap();
        }

        set_match(&state, "n2", 3);
        set_match(&state, "n3", 2);

        assert!(advance_commit_index(&state).unwrap());
        assert_eq!(state.commit_index(), LogIndex(3));
    }

    #[tokio::test]
    async fn commit_stalls_without_majority() {
        let (state, _dir) = leader_state();

        for i in 1..=3 {
            state
                .log_ref()
                .append(LogEntry::new(Term(1), LogIndex(i), Bytes::from("cmd")))
                .unwrap();
        }

        // Leader at 3, followers at 1 and 0: majority only covers index 1.
        set_match(&state, "n2", 1);
        set_match(&state, "n3", 0);

        assert!(advance_commit_index(&state).unwrap());
        assert_eq!(state.commit_index(), LogIndex(1));
        assert!(!advance_commit_index(&state).unwrap());
    }

    #[tokio::test]
    async fn earlier_term_entries_never_commit_by_counting() {
        let (state, _dir) = leader_state();
        state.set_current_term(Term(2));

        // All replicated entries are from term 1, but we now lead term 2.
        for i in 1..=3 {
            state
                .log_ref()
                .append(LogEntry::new(Term(1), LogIndex(i), Bytes::from("old")))
                .unwrap();
        }
        set_match(&state, "n2", 3);
        set_match(&state, "n3", 3);

        assert!(!advance_commit_index(&state).unwrap());
        assert_eq!(state.commit_index(), LogIndex::ZERO);

        // A current-term entry replicated to a majority unlocks everything
        // below it.
        state
            .log_ref()
            .append(LogEntry::new(Term(2), LogIndex(4), Bytes::from("new")))
            .unwrap();
        set_match(&state, "n2", 4);

        assert!(advance_commit_index(&state).unwrap());
        assert_eq!(state.commit_index(), LogIndex(4));
    }

    #[tokio::test]
    async fn apply_loop_forwards_in_order() {
        let (state, _dir) = leader_state();

        for i in 1..=3 {
            state
                .log_ref()
                .append(LogEntry::new(
                    Term(1),
                    LogIndex(i),
                    Bytes::from(format!("cmd{i}")),
                ))
                .unwrap();
        }
        {
            let mut volatile = state.volatile_state().write();
            state.set_commit_index(&mut volatile, LogIndex(3));
        }

        let (applied_tx, mut applied_rx) = tokio::sync::mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        tokio::spawn(apply_loop(state.clone(), applied_tx, shutdown_rx));

        for i in 1..=3u64 {
            let (index, cmd) = applied_rx.recv().await.unwrap();
            assert_eq!(index, LogIndex(i));
            assert_eq!(cmd, Bytes::from(format!("cmd{i}")));
        }
        assert_eq!(state.last_applied(), LogIndex(3));

        let _ = shutdown_tx.send(());
    }
}
