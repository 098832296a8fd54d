use kumo_server::{config::ServerConfig, node::Node};
use kumo_sink::DirSink;
use kumo_transport::TcpTransport;
use std::sync::Arc;

/// Exit codes: 0 clean shutdown, 1 configuration error, 2 fatal error on
/// persistent state.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "kumo.yaml".to_string());

    // Config file first, environment fallback.
    let config = if std::path::Path::new(&config_path).exists() {
        ServerConfig::load_from_file(&config_path)
    } else {
        tracing::warn!(path = %config_path, "config file not found, reading environment");
        ServerConfig::load_from_env()
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(node = %config.node_id, addr = %config.listen_addr, "starting kumo node");

    if let Err(code) = run(config).await {
        std::process::exit(code);
    }
}

async fn run(config: ServerConfig) -> Result<(), i32> {
    let listen_addr = config.listen_addr.parse().map_err(|e| {
        tracing::error!(error = %e, "bad listen_addr");
        1
    })?;

    let roster = config.roster().map_err(|e| {
        tracing::error!(error = %e, "bad roster");
        1
    })?;
    let peer_addrs = roster
        .into_iter()
        .filter(|(id, _)| *id != config.node_id)
        .collect();

    let transport = TcpTransport::bind(config.node_id.clone(), listen_addr, peer_addrs)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to bind transport");
            2
        })?;

    let sink = Arc::new(DirSink::open(config.sink_dir()).map_err(|e| {
        tracing::error!(error = %e, "failed to open durable sink");
        2
    })?);

    let node = Node::new(config, transport, sink).map_err(|e| {
        tracing::error!(error = %e, "failed to assemble node");
        2
    })?;
    node.start();
    tracing::info!("kumo node running");

    let mut fatal = node.subscribe_fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            node.shutdown();
            Ok(())
        }
        _ = fatal.changed() => {
            let reason = fatal.borrow().clone().unwrap_or_default();
            tracing::error!(reason = %reason, "fatal persistence failure, stopping");
            node.shutdown();
            Err(2)
        }
    }
}
