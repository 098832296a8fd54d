//! Incoming RPC dispatch.
//!
//! Bridges the transport's inbox of [`RpcMessage`]s to the [`RaftState`]
//! handlers and pushes replies back through their oneshot slots. Accepted
//! AppendEntries and granted votes reset the election timer here.

use crate::state::RaftState;
use crate::timer::ElectionTimer;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    election_timer: Arc<ElectionTimer>,
    fatal_tx: tokio::sync::watch::Sender<Option<String>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = handle_rpc_message(&state, &election_timer, msg) {
                            tracing::error!(error = %e, "rpc handling failed");
                            if e.is_fatal() {
                                let _ = fatal_tx.send(Some(e.to_string()));
                                break;
                            }
                        }
                    }
                    None => {
                        tracing::debug!("rpc inbox closed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("rpc handler loop shutting down");
                break;
            }
        }
    }
}

fn handle_rpc_message(
    state: &Arc<RaftState>,
    election_timer: &Arc<ElectionTimer>,
    msg: RpcMessage,
) -> crate::error::Result<()> {
    match msg {
        RpcMessage::RequestVote {
            request,
            response_tx,
        } => {
            let response = state.handle_request_vote(request)?;
            if response.vote_granted {
                election_timer.reset();
            }
            let _ = response_tx.send(response);
        }
        RpcMessage::AppendEntries {
            request,
            response_tx,
        } => {
            let response = state.handle_append_entries(request)?;
            if response.success {
                election_timer.reset();
            }
            let _ = response_tx.send(response);
        }
    }
    Ok(())
}
