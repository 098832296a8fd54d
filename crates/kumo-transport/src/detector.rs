//! Phi-accrual failure detection.
//!
//! Each peer's heartbeat inter-arrival times feed a sliding window from which
//! a suspicion level is computed: phi = -log10(1 - F(elapsed)), with F the
//! normal CDF fitted to the window's mean and variance. Crossing the
//! suspected threshold marks a peer `Suspected`, crossing the failed
//! threshold marks it `Failed`, and any observed traffic snaps it back to
//! `Alive`. Transitions are published on a broadcast channel.

use crate::{Envelope, MessageKind, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Detector tuning. Defaults follow the cluster-wide defaults {8, 12, 100}.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Phi above which a peer becomes `Suspected`.
    pub suspected_threshold: f64,

    /// Phi above which a peer becomes `Failed`.
    pub failed_threshold: f64,

    /// Number of inter-arrival samples retained per peer.
    pub window: usize,

    /// How often the scan task re-evaluates phi for every peer.
    pub scan_interval: Duration,

    /// Expected heartbeat period, used to seed phi before the window fills.
    pub heartbeat_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            suspected_threshold: 8.0,
            failed_threshold: 12.0,
            window: 100,
            scan_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

/// Peer liveness as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspected,
    Failed,
}

/// A peer state transition, published to subscribers.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: String,
    pub from: PeerState,
    pub to: PeerState,
    pub phi: f64,
}

struct PeerRecord {
    last_seen: Instant,
    intervals: VecDeque<f64>,
    state: PeerState,
}

/// Phi-accrual failure detector for a fixed peer set.
pub struct FailureDetector {
    config: DetectorConfig,
    peers: Mutex<HashMap<String, PeerRecord>>,
    events: broadcast::Sender<PeerEvent>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig, peers: impl IntoIterator<Item = String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let now = Instant::now();
        let records = peers
            .into_iter()
            .map(|id| {
                (
                    id,
                    PeerRecord {
                        last_seen: now,
                        intervals: VecDeque::new(),
                        state: PeerState::Alive,
                    },
                )
            })
            .collect();

        Arc::new(Self {
            config,
            peers: Mutex::new(records),
            events,
        })
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Record traffic from a peer. Any successful message counts, not only
    /// heartbeats; a failed peer that speaks again is alive again.
    pub fn observe(&self, peer: &str) {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(peer) else {
            return;
        };

        let now = Instant::now();
        let interval = now.duration_since(record.last_seen).as_secs_f64();
        record.last_seen = now;

        record.intervals.push_back(interval);
        if record.intervals.len() > self.config.window {
            record.intervals.pop_front();
        }

        if record.state != PeerState::Alive {
            let event = PeerEvent {
                peer: peer.to_string(),
                from: record.state,
                to: PeerState::Alive,
                phi: 0.0,
            };
            record.state = PeerState::Alive;
            tracing::info!(peer = %event.peer, "peer recovered");
            let _ = self.events.send(event);
        }
    }

    /// Current suspicion level for a peer.
    pub fn phi(&self, peer: &str) -> f64 {
        let peers = self.peers.lock();
        let Some(record) = peers.get(peer) else {
            return f64::INFINITY;
        };
        self.phi_of(record)
    }

    fn phi_of(&self, record: &PeerRecord) -> f64 {
        let elapsed = record.last_seen.elapsed().as_secs_f64();

        let (mean, std_dev) = if record.intervals.len() >= 2 {
            let n = record.intervals.len() as f64;
            let mean = record.intervals.iter().sum::<f64>() / n;
            let variance = record
                .intervals
                .iter()
                .map(|x| (x - mean).powi(2))
                .sum::<f64>()
                / n;
            (mean, variance.sqrt().max(mean / 4.0).max(1e-3))
        } else {
            // Not enough samples: assume the configured heartbeat period.
            let mean = self.config.heartbeat_interval.as_secs_f64();
            (mean, (mean / 4.0).max(1e-3))
        };

        let f = normal_cdf((elapsed - mean) / std_dev);
        let survival = (1.0 - f).max(1e-20);
        -survival.log10()
    }

    /// Current state of a peer.
    pub fn state(&self, peer: &str) -> PeerState {
        self.peers
            .lock()
            .get(peer)
            .map(|r| r.state)
            .unwrap_or(PeerState::Failed)
    }

    /// Peers not currently marked failed.
    pub fn live_peers(&self) -> Vec<String> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, r)| r.state != PeerState::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Re-evaluate phi for every peer, escalating states as thresholds are
    /// crossed. Recovery only happens in `observe`.
    pub fn scan(&self) {
        let mut transitions = Vec::new();
        {
            let mut peers = self.peers.lock();
            for (id, record) in peers.iter_mut() {
                let phi = self.phi_of(record);
                let next = if phi > self.config.failed_threshold {
                    PeerState::Failed
                } else if phi > self.config.suspected_threshold {
                    PeerState::Suspected
                } else {
                    record.state
                };

                // Escalation only; Failed never downgrades here.
                let escalates = matches!(
                    (record.state, next),
                    (PeerState::Alive, PeerState::Suspected)
                        | (PeerState::Alive, PeerState::Failed)
                        | (PeerState::Suspected, PeerState::Failed)
                );
                if escalates {
                    transitions.push(PeerEvent {
                        peer: id.clone(),
                        from: record.state,
                        to: next,
                        phi,
                    });
                    record.state = next;
                }
            }
        }

        for event in transitions {
            tracing::warn!(
                peer = %event.peer,
                phi = event.phi,
                from = ?event.from,
                to = ?event.to,
                "peer state changed"
            );
            let _ = self.events.send(event);
        }
    }

    /// Background scan loop.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan(),
                _ = shutdown.recv() => {
                    tracing::debug!("failure detector shutting down");
                    break;
                }
            }
        }
    }
}

/// Periodic heartbeat broadcast keeping the peers' detectors fed.
pub async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let envelope = Envelope::new(
                    MessageKind::Heartbeat,
                    transport.local_id().to_string(),
                    Bytes::new(),
                );
                transport.broadcast(envelope).await;
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}
