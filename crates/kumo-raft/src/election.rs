//! Leader election.
//!
//! A follower whose election timer fires becomes a candidate: it bumps its
//! term, votes for itself (persisted), and asks every peer for a vote in
//! parallel. A majority of grants makes it leader; a higher term in any
//! response sends it back to follower; anything else is a split vote and the
//! timer runs again with a fresh random timeout.

use crate::config::RaftConfig;
use crate::error::Result;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;

/// Outcome of one election attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won { term: Term, votes: usize },
    Lost { current_term: Term },
    SplitVote,
}

/// Run a single election as candidate.
pub async fn run_election(
    state: Arc<RaftState>,
    config: &RaftConfig,
    transport: Arc<dyn RaftTransport>,
) -> Result<ElectionOutcome> {
    let term = state.start_election()?;

    let node_id = state.node_id().clone();
    let last_log_index = state.log_ref().last_index();
    let last_log_term = state.log_ref().last_term();

    let mut votes = HashSet::new();
    votes.insert(node_id.clone());

    let mut vote_futures = Vec::new();
    for peer in state.peers() {
        let transport = transport.clone();
        let request = RequestVoteRequest {
            term,
            candidate_id: node_id.clone(),
            last_log_index,
            last_log_term,
        };
        let rpc_timeout = config.rpc_timeout;

        vote_futures.push(async move {
            let result = timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
            (peer, result)
        });
    }

    let results = futures::future::join_all(vote_futures).await;

    for (peer, result) in results {
        match result {
            Ok(Ok(response)) => {
                if state.current_term() != term {
                    // Someone moved us on while we were collecting.
                    return Ok(ElectionOutcome::Lost {
                        current_term: state.current_term(),
                    });
                }
                if response.term > term {
                    state.observe_term(response.term)?;
                    return Ok(ElectionOutcome::Lost {
                        current_term: response.term,
                    });
                }
                if response.vote_granted {
                    votes.insert(peer);
                }
            }
            // RPC failure or timeout: treat as a missing vote.
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    if state.role() != Role::Candidate {
        return Ok(ElectionOutcome::Lost {
            current_term: state.current_term(),
        });
    }

    if votes.len() >= quorum(state.roster().len()) {
        Ok(ElectionOutcome::Won {
            term,
            votes: votes.len(),
        })
    } else {
        Ok(ElectionOutcome::SplitVote)
    }
}

/// Background election loop: waits for timer fires, runs elections, and on a
/// win transitions to leader and immediately nudges replication so the empty
/// AppendEntries goes out before competitors time out again.
pub async fn election_loop(
    state: Arc<RaftState>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    mut timeout_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(_) = timeout_rx.recv() => {
                if state.role() == Role::Leader {
                    continue;
                }

                match run_election(state.clone(), &config, transport.clone()).await {
                    Ok(ElectionOutcome::Won { term, votes }) => {
                        tracing::info!(term = %term, votes, "won election");
                        if let Err(e) = state.become_leader() {
                            tracing::error!(error = %e, "failed to become leader");
                            if e.is_fatal() {
                                break;
                            }
                            continue;
                        }
                        // Suppress competing elections right away.
                        state.replicate_kick.notify_one();
                    }
                    Ok(ElectionOutcome::Lost { current_term }) => {
                        tracing::debug!(term = %current_term, "election lost");
                    }
                    Ok(ElectionOutcome::SplitVote) => {
                        tracing::debug!("split vote, waiting for next timeout");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "election failed");
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("election loop shutting down");
                break;
            }
        }
    }
}

/// Log up-to-dateness comparison used by voters: later last term wins; equal
/// terms fall back to log length.
pub fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    our_last_term: Term,
    our_last_index: LogIndex,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}
