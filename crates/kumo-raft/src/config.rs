//! Consensus tuning parameters.

use std::time::Duration;

/// Raft timing and replication limits.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Leader heartbeat period. Must stay under half the minimum election
    /// timeout or followers will start spurious elections.
    ///
    /// Default: 50ms
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    ///
    /// Default: 150ms
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout.
    ///
    /// Default: 300ms
    pub election_timeout_max: Duration,

    /// Per-RPC timeout for votes and append entries.
    ///
    /// Default: 100ms
    pub rpc_timeout: Duration,

    /// How long `propose` waits for its entry to commit before giving up.
    /// The entry itself is never cancelled; only the wait is.
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// Maximum entries shipped in one AppendEntries RPC.
    ///
    /// Default: 1000
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(100),
            propose_timeout: Duration::from_millis(5000),
            max_entries_per_append: 1000,
        }
    }
}

impl RaftConfig {
    /// Check the timing invariants hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval * 2 >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min / 2 ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        Ok(())
    }

    /// A fresh random timeout in [min, max]. Each draw differs so competing
    /// candidates rarely collide twice.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
