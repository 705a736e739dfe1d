//! Meshwork Node Binary
//!
//! Main entry point for running a mesh overlay node.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use meshwork_core::node::{MeshNode, NodeConfig};

#[tokio::main]
async fn main() {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Meshwork Node v{}", env!("CARGO_PKG_VERSION"));
    info!("============================");

    // Load or create configuration
    let config_path = PathBuf::from("config.json");
    let config = if config_path.exists() {
        match NodeConfig::load(&config_path) {
            Ok(cfg) => {
                info!("Loaded configuration from {}", config_path.display());
                cfg
            }
            Err(e) => {
                error!("Failed to load config: {}", e);
                info!("Using default configuration");
                NodeConfig::default()
            }
        }
    } else {
        info!("No config file found, using defaults");
        let config = NodeConfig::default();

        // Save default config for reference
        if let Err(e) = config.save(&config_path) {
            error!("Failed to save default config: {}", e);
        } else {
            info!("Saved default configuration to {}", config_path.display());
        }

        config
    };

    // Print configuration summary
    info!("Network context: {}", config.identity.network_context);
    info!("Host name: {}", config.identity.host_name);
    info!(
        "Listen address: {}:{}",
        config.network.listen_host, config.network.listen_port
    );
    info!("Bootstrap peers: {}", config.network.bootstrap_peers.len());

    let node = Arc::new(MeshNode::new(config));
    info!("Peer ID: {}", node.peer_id());

    let node_run = Arc::clone(&node);
    let run = tokio::spawn(async move {
        if let Err(e) = node_run.start().await {
            error!("Node failed: {}", e);
            std::process::exit(1);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    info!("Received shutdown signal");
    node.stop().await;
    let _ = run.await;

    info!("Goodbye!");
}
