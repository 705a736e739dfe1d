use std::sync::Arc;
use std::time::Duration;

use meshwork_core::node::{MeshNode, NodeConfig};

pub struct TestNode {
    pub node: Arc<MeshNode>,
    pub p2p_port: u16,
}

impl TestNode {
    pub async fn start(index: u16, peers: Vec<String>) -> Self {
        let p2p_port = 14000 + index;

        let mut config = NodeConfig::default();
        config.identity.network_context = "testnet".to_string();
        config.identity.host_name = format!("host-{}", index);
        config.network.listen_host = "127.0.0.1".to_string();
        config.network.listen_port = p2p_port;
        config.network.advertised = vec![format!("127.0.0.1:{}", p2p_port)];
        config.network.bootstrap_peers = peers;
        config.network.connect_timeout_ms = 1000;
        config.network.handshake_timeout_ms = 1000;
        // Keep the probe and prune machinery quiet during short tests.
        config.black_hole.probe_interval_ms = 60_000;
        config.gossip.prune_interval_secs = 600;

        let node = Arc::new(MeshNode::new(config));

        let runner = Arc::clone(&node);
        tokio::spawn(async move {
            let _ = runner.start().await;
        });

        // Let it bind and begin bootstrapping
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self { node, p2p_port }
    }

    pub async fn stop(&self) {
        self.node.stop().await;
    }
}
