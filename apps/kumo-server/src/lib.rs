//! kumo-server: one node of the kumo coordination cluster.
//!
//! Exposes the node wiring as a library so integration tests can assemble
//! multi-node clusters over in-memory transports; the binary in `main.rs`
//! does the same over TCP.

pub mod api;
pub mod config;
pub mod node;
pub mod rpc;

pub use api::{ClientError, ClusterStatus, PeerStatus};
pub use config::{ConfigError, ServerConfig};
pub use node::Node;
pub use rpc::Delivery;
