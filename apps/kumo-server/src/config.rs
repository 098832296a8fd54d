//! Node configuration.
//!
//! Loaded from a YAML file or `KUMO_*` environment variables. The roster is
//! static: `peers` must list every node in the cluster, this one included,
//! as `nodeId@host:port`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Full node configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "n1"
/// listen_addr: "127.0.0.1:7001"
/// peers:
///   - "n1@127.0.0.1:7001"
///   - "n2@127.0.0.1:7002"
///   - "n3@127.0.0.1:7003"
/// data_dir: "/var/lib/kumo/n1"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identifier of this node.
    pub node_id: String,

    /// Address this node listens on.
    pub listen_addr: String,

    /// Static cluster roster, `nodeId@host:port`, including this node.
    pub peers: Vec<String>,

    /// Directory for the raft log, vote state, and the durable sink.
    pub data_dir: PathBuf,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_deadlock_scan_interval_ms")]
    pub deadlock_scan_interval_ms: u64,

    #[serde(default = "default_queue_max_retries")]
    pub queue_max_retries: u32,

    #[serde(default = "default_queue_default_visibility_ms")]
    pub queue_default_visibility_ms: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_phi_suspected_threshold")]
    pub phi_suspected_threshold: f64,

    #[serde(default = "default_phi_failed_threshold")]
    pub phi_failed_threshold: f64,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}
fn default_election_timeout_max_ms() -> u64 {
    300
}
fn default_heartbeat_interval_ms() -> u64 {
    50
}
fn default_deadlock_scan_interval_ms() -> u64 {
    500
}
fn default_queue_max_retries() -> u32 {
    5
}
fn default_queue_default_visibility_ms() -> u64 {
    30_000
}
fn default_cache_capacity() -> usize {
    1000
}
fn default_phi_suspected_threshold() -> f64 {
    8.0
}
fn default_phi_failed_threshold() -> f64 {
    12.0
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid field: {0}")]
    InvalidField(String),
}

impl ServerConfig {
    /// Load from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("failed to read {path}: {e}")))?;
        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse {path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables:
    /// `KUMO_NODE_ID`, `KUMO_LISTEN_ADDR`, `KUMO_PEERS` (comma-separated),
    /// `KUMO_DATA_DIR`, and optional `KUMO_*` overrides of the tunables.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        fn required(name: &str) -> Result<String, ConfigError> {
            std::env::var(name).map_err(|_| ConfigError::MissingField(name.to_string()))
        }
        fn optional<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidField(format!("{name}={raw}"))),
                Err(_) => Ok(default),
            }
        }

        let config = Self {
            node_id: required("KUMO_NODE_ID")?,
            listen_addr: required("KUMO_LISTEN_ADDR")?,
            peers: required("KUMO_PEERS")?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            data_dir: PathBuf::from(required("KUMO_DATA_DIR")?),
            election_timeout_min_ms: optional(
                "KUMO_ELECTION_TIMEOUT_MIN_MS",
                default_election_timeout_min_ms(),
            )?,
            election_timeout_max_ms: optional(
                "KUMO_ELECTION_TIMEOUT_MAX_MS",
                default_election_timeout_max_ms(),
            )?,
            heartbeat_interval_ms: optional(
                "KUMO_HEARTBEAT_INTERVAL_MS",
                default_heartbeat_interval_ms(),
            )?,
            deadlock_scan_interval_ms: optional(
                "KUMO_DEADLOCK_SCAN_INTERVAL_MS",
                default_deadlock_scan_interval_ms(),
            )?,
            queue_max_retries: optional("KUMO_QUEUE_MAX_RETRIES", default_queue_max_retries())?,
            queue_default_visibility_ms: optional(
                "KUMO_QUEUE_DEFAULT_VISIBILITY_MS",
                default_queue_default_visibility_ms(),
            )?,
            cache_capacity: optional("KUMO_CACHE_CAPACITY", default_cache_capacity())?,
            phi_suspected_threshold: optional(
                "KUMO_PHI_SUSPECTED_THRESHOLD",
                default_phi_suspected_threshold(),
            )?,
            phi_failed_threshold: optional(
                "KUMO_PHI_FAILED_THRESHOLD",
                default_phi_failed_threshold(),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the roster into `(node_id, addr)` pairs.
    pub fn roster(&self) -> Result<HashMap<String, SocketAddr>, ConfigError> {
        let mut roster = HashMap::new();
        for entry in &self.peers {
            let (id, addr) = entry.split_once('@').ok_or_else(|| {
                ConfigError::InvalidField(format!("peer `{entry}` is not nodeId@host:port"))
            })?;
            let addr: SocketAddr = addr.parse().map_err(|e| {
                ConfigError::InvalidField(format!("peer `{entry}` address: {e}"))
            })?;
            if roster.insert(id.to_string(), addr).is_some() {
                return Err(ConfigError::InvalidField(format!(
                    "duplicate peer id `{id}`"
                )));
            }
        }
        Ok(roster)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidField("node_id cannot be empty".into()));
        }

        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidField(format!("listen_addr: {e}")))?;

        let roster = self.roster()?;
        if !roster.contains_key(&self.node_id) {
            return Err(ConfigError::InvalidField(format!(
                "peers must include this node (`{}`)",
                self.node_id
            )));
        }

        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err(ConfigError::InvalidField(
                "election_timeout_min_ms must be < election_timeout_max_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms * 2 >= self.election_timeout_min_ms {
            return Err(ConfigError::InvalidField(
                "heartbeat_interval_ms must be < election_timeout_min_ms / 2".into(),
            ));
        }
        if self.phi_suspected_threshold >= self.phi_failed_threshold {
            return Err(ConfigError::InvalidField(
                "phi_suspected_threshold must be < phi_failed_threshold".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::InvalidField("cache_capacity must be > 0".into()));
        }

        Ok(())
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn deadlock_scan_interval(&self) -> Duration {
        Duration::from_millis(self.deadlock_scan_interval_ms)
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn sink_dir(&self) -> PathBuf {
        self.data_dir.join("sink")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            node_id: "n1".into(),
            listen_addr: "127.0.0.1:7001".into(),
            peers: vec![
                "n1@127.0.0.1:7001".into(),
                "n2@127.0.0.1:7002".into(),
                "n3@127.0.0.1:7003".into(),
            ],
            data_dir: PathBuf::from("/tmp/kumo-test"),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            deadlock_scan_interval_ms: default_deadlock_scan_interval_ms(),
            queue_max_retries: default_queue_max_retries(),
            queue_default_visibility_ms: default_queue_default_visibility_ms(),
            cache_capacity: default_cache_capacity(),
            phi_suspected_threshold: default_phi_suspected_threshold(),
            phi_failed_threshold: default_phi_failed_threshold(),
        }
    }

    #[test]
    fn valid_config_passes() {
        let config = base_config();
        assert!(config.validate().is_ok());
        let roster = config.roster().unwrap();
        assert_eq!(roster.len(), 3);
        assert_eq!(
            roster["n2"],
            "127.0.0.1:7002".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn roster_must_include_self() {
        let mut config = base_config();
        config.node_id = "outsider".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField(_))
        ));
    }

    #[test]
    fn malformed_peer_rejected() {
        let mut config = base_config();
        config.peers.push("no-at-sign:7004".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_must_clear_election_window() {
        let mut config = base_config();
        config.heartbeat_interval_ms = 100; // >= 150/2
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_round_trip_with_defaults() {
        let yaml = r#"
node_id: "n1"
listen_addr: "127.0.0.1:7001"
peers:
  - "n1@127.0.0.1:7001"
data_dir: "/tmp/kumo-n1"
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.queue_max_retries, 5);
        assert_eq!(config.queue_default_visibility_ms, 30_000);
        assert_eq!(config.cache_capacity, 1000);
        assert_eq!(config.phi_suspected_threshold, 8.0);
        assert!(config.validate().is_ok());
    }
}
