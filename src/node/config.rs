//! Node configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;
use crate::topology::BlackHoleConfig;
use crate::types::PeerId;

/// Full node configuration.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Identity configuration
    pub identity: IdentityConfig,

    /// Network configuration
    pub network: NetworkConfig,

    /// Gossip maintenance configuration
    pub gossip: GossipConfig,

    /// Black-hole detector configuration
    pub black_hole: BlackHoleSection,

    /// RPC configuration
    pub rpc: RpcConfig,
}

/// Identity configuration. The peer id is derived, not stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Application id this node belongs to
    pub application_id: String,

    /// Network context (overlay name)
    pub network_context: String,

    /// Host name within the context
    pub host_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            application_id: "meshwork".to_string(),
            network_context: "default".to_string(),
            host_name: format!("node-{:04x}", rand::random::<u16>()),
        }
    }
}

impl IdentityConfig {
    /// Derive the stable peer id for this identity.
    pub fn peer_id(&self) -> PeerId {
        PeerId::derive(&self.application_id, &self.network_context, &self.host_name)
    }
}

/// Network configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to listen on
    pub listen_host: String,

    /// Port to listen on
    pub listen_port: u16,

    /// Endpoints advertised to peers ("host:port"); defaults to the
    /// listen address when empty
    pub advertised: Vec<String>,

    /// Bootstrap peers ("host:port")
    pub bootstrap_peers: Vec<String>,

    /// Connect timeout (ms)
    pub connect_timeout_ms: u64,

    /// Handshake timeout (ms)
    pub handshake_timeout_ms: u64,

    /// Keep-alive interval (ms)
    pub keep_alive_interval_ms: u64,

    /// Idle deadline before a session is closed (ms)
    pub idle_deadline_ms: u64,

    /// Maximum wire frame size (bytes)
    pub max_frame_size: usize,

    /// Outbound queue depth per session
    pub send_queue_depth: usize,

    /// Send attempts for reliable methods
    pub reliable_attempts: u32,

    /// Maximum concurrent sessions
    pub max_peers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 4890,
            advertised: vec![],
            bootstrap_peers: vec![],
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            keep_alive_interval_ms: defaults.keep_alive_interval.as_millis() as u64,
            idle_deadline_ms: defaults.idle_deadline.as_millis() as u64,
            max_frame_size: defaults.max_frame_size,
            send_queue_depth: defaults.send_queue_depth,
            reliable_attempts: defaults.reliable_attempts,
            max_peers: defaults.max_sessions,
        }
    }
}

impl NetworkConfig {
    /// Build the session-layer tunables.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            idle_deadline: Duration::from_millis(self.idle_deadline_ms),
            max_frame_size: self.max_frame_size,
            send_queue_depth: self.send_queue_depth,
            reliable_attempts: self.reliable_attempts,
            max_sessions: self.max_peers,
        }
    }
}

/// Gossip maintenance configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Grace period before an unreferenced record is pruned (secs)
    pub prune_grace_secs: u64,

    /// How often the prune pass runs (secs)
    pub prune_interval_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            prune_grace_secs: 300,
            prune_interval_secs: 60,
        }
    }
}

/// Black-hole detector configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlackHoleSection {
    /// Consecutive probe failures before flagging
    pub failure_threshold: u32,

    /// Consecutive probe successes before clearing
    pub recovery_threshold: u32,

    /// Delay between canary probes (ms)
    pub probe_interval_ms: u64,

    /// Probe response deadline (ms)
    pub probe_timeout_ms: u64,
}

impl Default for BlackHoleSection {
    fn default() -> Self {
        let defaults = BlackHoleConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_threshold: defaults.recovery_threshold,
            probe_interval_ms: defaults.probe_interval.as_millis() as u64,
            probe_timeout_ms: defaults.probe_timeout.as_millis() as u64,
        }
    }
}

impl BlackHoleSection {
    /// Build the detector tunables.
    pub fn detector_config(&self) -> BlackHoleConfig {
        BlackHoleConfig {
            failure_threshold: self.failure_threshold,
            recovery_threshold: self.recovery_threshold,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
        }
    }
}

/// RPC configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Default two-way call deadline (ms)
    pub default_call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: 30_000,
        }
    }
}

impl RpcConfig {
    /// Default call deadline as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }
}

impl NodeConfig {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Save configuration to file.
    pub fn save(&self, path: &PathBuf) -> Result<(), String> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();

        assert_eq!(config.network.listen_port, 4890);
        assert_eq!(config.black_hole.failure_threshold, 3);
        assert_eq!(config.rpc.default_call_timeout_ms, 30_000);
        assert_eq!(config.identity.application_id, "meshwork");
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let recovered: NodeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.network.listen_port, recovered.network.listen_port);
        assert_eq!(config.identity.host_name, recovered.identity.host_name);
    }

    #[test]
    fn test_config_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = NodeConfig::default();
        config.save(&path).unwrap();
        let recovered = NodeConfig::load(&path).unwrap();

        assert_eq!(
            config.identity.peer_id().as_str(),
            recovered.identity.peer_id().as_str()
        );
    }

    #[test]
    fn test_session_config_conversion() {
        let mut network = NetworkConfig::default();
        network.idle_deadline_ms = 1234;

        let session = network.session_config();
        assert_eq!(session.idle_deadline, Duration::from_millis(1234));
    }
}
