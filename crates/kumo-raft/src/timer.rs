//! Randomized election timer.
//!
//! Fires when the timeout elapses without a reset; resets arrive on every
//! valid AppendEntries and every granted vote. Each cycle draws a fresh
//! random timeout so split votes don't repeat.

use crate::config::RaftConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Notify,
    shutdown_notify: Notify,
    timeout_tx: mpsc::Sender<()>,
    timeout_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Arc<Self> {
        let (timeout_tx, timeout_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            reset_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            timeout_tx,
            timeout_rx: parking_lot::Mutex::new(Some(timeout_rx)),
        })
    }

    /// Take the timeout channel. Single consumer: the election loop.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.timeout_rx.lock().take()
    }

    /// Restart the countdown with a fresh random timeout.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
    }

    /// Timer loop; spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        loop {
            let timeout = self.config.random_election_timeout();
            let deadline = Instant::now() + timeout;

            tokio::select! {
                _ = sleep_until(deadline) => {
                    if self.timeout_tx.send(()).await.is_err() {
                        break;
                    }
                }
                _ = self.reset_notify.notified() => continue,
                _ = self.shutdown_notify.notified() => break,
            }
        }
    }
}

async fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        sleep(deadline - now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fires_after_timeout() {
        let timer = ElectionTimer::new(fast_config());
        let mut rx = timer.take_receiver().unwrap();

        tokio::spawn(timer.clone().run());

        let fired = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn reset_defers_firing() {
        let timer = ElectionTimer::new(fast_config());
        let mut rx = timer.take_receiver().unwrap();

        tokio::spawn(timer.clone().run());

        // Keep resetting faster than the minimum timeout.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            timer.reset();
        }
        assert!(timeout(Duration::from_millis(5), rx.recv()).await.is_err());

        // Stop resetting; it fires.
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn receiver_is_single_take() {
        let timer = ElectionTimer::new(fast_config());
        assert!(timer.take_receiver().is_some());
        assert!(timer.take_receiver().is_none());
    }
}
