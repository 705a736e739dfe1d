//! NAT gateway registrar.
//!
//! Maintains the local peer's externally reachable endpoints obtained
//! through gateway port mapping. Everything here is best-effort: a
//! missing or failing gateway is a normal operating condition and is
//! surfaced as a soft error, never a crash. Successful changes bump
//! the self record's gateway list and are gossiped like any other
//! sub-object.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::topology::{GossipPropagator, PeerRecordStore};
use crate::types::AddressEndPoint;

/// Transport protocol of a port mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// TCP mapping
    Tcp,
    /// UDP mapping
    Udp,
}

/// One gateway port mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Externally visible endpoint
    pub external: AddressEndPoint,

    /// Mapped protocol
    pub protocol: Protocol,

    /// Internal endpoint traffic is forwarded to
    pub internal: AddressEndPoint,

    /// Whether the mapping is active
    pub enabled: bool,

    /// Human-readable label shown in gateway UIs
    pub description: String,
}

/// NAT gateway operation failure. Soft by design.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MappingError {
    /// Gateway discovery or communication failed
    #[error("gateway mapping failed: {0}")]
    MappingFailed(String),
}

/// External collaborator boundary to the actual gateway device.
pub trait Gateway: Send + Sync {
    /// Install or refresh a port mapping on the device.
    fn add_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError>;

    /// Remove a mapping from the device.
    fn remove_mapping(&self, port: u16, protocol: Protocol) -> Result<(), MappingError>;

    /// The gateway's external address, if it reports one.
    fn external_address(&self) -> Option<AddressEndPoint>;
}

/// Gateway stand-in when discovery found nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullGateway;

impl Gateway for NullGateway {
    fn add_mapping(&self, _mapping: &PortMapping) -> Result<(), MappingError> {
        Err(MappingError::MappingFailed("no gateway discovered".to_string()))
    }

    fn remove_mapping(&self, _port: u16, _protocol: Protocol) -> Result<(), MappingError> {
        Err(MappingError::MappingFailed("no gateway discovered".to_string()))
    }

    fn external_address(&self) -> Option<AddressEndPoint> {
        None
    }
}

/// Tracks the local peer's port mappings and keeps the gossiped
/// gateway list in sync.
pub struct NatRegistrar {
    gateway: Arc<dyn Gateway>,
    store: Arc<PeerRecordStore>,
    propagator: Arc<GossipPropagator>,
    mappings: RwLock<HashMap<(u16, Protocol), PortMapping>>,
}

impl NatRegistrar {
    /// Create a registrar over the discovered gateway (or a
    /// [`NullGateway`] when none was found).
    pub fn new(
        gateway: Arc<dyn Gateway>,
        store: Arc<PeerRecordStore>,
        propagator: Arc<GossipPropagator>,
    ) -> Self {
        Self {
            gateway,
            store,
            propagator,
            mappings: RwLock::new(HashMap::new()),
        }
    }

    /// Install or refresh a mapping.
    ///
    /// Idempotent per (external port, protocol): refreshing replaces
    /// the stored mapping, leaving exactly one active entry for the
    /// pair.
    pub fn add_or_refresh_mapping(
        &self,
        external: AddressEndPoint,
        protocol: Protocol,
        internal: AddressEndPoint,
        enabled: bool,
        description: &str,
    ) -> Result<PortMapping, MappingError> {
        let mapping = PortMapping {
            external,
            protocol,
            internal,
            enabled,
            description: description.to_string(),
        };

        self.gateway.add_mapping(&mapping)?;

        let key = (mapping.external.port(), protocol);
        self.mappings.write().insert(key, mapping.clone());

        self.publish_gateways();
        Ok(mapping)
    }

    /// Remove a mapping. Returns whether one existed locally.
    ///
    /// Gateway-side removal failures are logged and ignored; the local
    /// list is authoritative for what we advertise.
    pub fn remove_mapping(&self, port: u16, protocol: Protocol) -> bool {
        if let Err(e) = self.gateway.remove_mapping(port, protocol) {
            debug!("gateway removal for port {} failed: {}", port, e);
        }

        let removed = self.mappings.write().remove(&(port, protocol)).is_some();
        if removed {
            self.publish_gateways();
        }
        removed
    }

    /// All currently registered mappings.
    pub fn list_mappings(&self) -> Vec<PortMapping> {
        self.mappings.read().values().cloned().collect()
    }

    /// Re-install every registered mapping on the gateway, e.g. after
    /// a gateway reboot dropped its table. Failures are logged per
    /// mapping and do not abort the sweep.
    pub fn refresh_all(&self) {
        let mappings = self.list_mappings();
        for mapping in mappings {
            if let Err(e) = self.gateway.add_mapping(&mapping) {
                warn!(
                    "failed to refresh mapping for external port {}: {}",
                    mapping.external.port(),
                    e
                );
            }
        }
    }

    /// Push the enabled external endpoints into the self record and
    /// gossip the change.
    fn publish_gateways(&self) {
        let gateways: Vec<AddressEndPoint> = {
            let mappings = self.mappings.read();
            let mut list: Vec<AddressEndPoint> = mappings
                .values()
                .filter(|m| m.enabled)
                .map(|m| m.external.clone())
                .collect();
            list.sort();
            list
        };

        let delta = self.store.set_nat_gateways(gateways);
        self.propagator.publish_local(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::DeltaSink;
    use crate::topology::RecordDelta;
    use crate::types::PeerId;

    struct NoopSink;

    impl DeltaSink for NoopSink {
        fn send_delta(&self, _neighbor: &PeerId, _delta: &RecordDelta) {}
    }

    /// In-memory gateway that can be told to fail.
    #[derive(Default)]
    struct TestGateway {
        fail: bool,
        installed: RwLock<Vec<u16>>,
    }

    impl Gateway for TestGateway {
        fn add_mapping(&self, mapping: &PortMapping) -> Result<(), MappingError> {
            if self.fail {
                return Err(MappingError::MappingFailed("device offline".to_string()));
            }
            self.installed.write().push(mapping.external.port());
            Ok(())
        }

        fn remove_mapping(&self, port: u16, _protocol: Protocol) -> Result<(), MappingError> {
            if self.fail {
                return Err(MappingError::MappingFailed("device offline".to_string()));
            }
            self.installed.write().retain(|p| *p != port);
            Ok(())
        }

        fn external_address(&self) -> Option<AddressEndPoint> {
            Some(AddressEndPoint::new("203.0.113.7", 0))
        }
    }

    fn registrar(gateway: Arc<dyn Gateway>) -> NatRegistrar {
        let store = Arc::new(PeerRecordStore::new(PeerId::from_raw("self")));
        let propagator = Arc::new(GossipPropagator::new(
            Arc::clone(&store),
            Arc::new(NoopSink),
        ));
        NatRegistrar::new(gateway, store, propagator)
    }

    fn external(port: u16) -> AddressEndPoint {
        AddressEndPoint::new("203.0.113.7", port)
    }

    fn internal(port: u16) -> AddressEndPoint {
        AddressEndPoint::new("192.168.1.20", port)
    }

    #[test]
    fn test_add_mapping_publishes_gateway_list() {
        let r = registrar(Arc::new(TestGateway::default()));

        r.add_or_refresh_mapping(external(4040), Protocol::Tcp, internal(4040), true, "mesh")
            .unwrap();

        let record = r.store.get(r.store.local_id()).unwrap();
        assert_eq!(record.nat_gateways.get(), &vec![external(4040)]);
        assert_eq!(record.nat_gateways.state_id(), 1);
    }

    #[test]
    fn test_add_is_idempotent_per_port_protocol() {
        let r = registrar(Arc::new(TestGateway::default()));

        r.add_or_refresh_mapping(external(4040), Protocol::Tcp, internal(4040), true, "mesh")
            .unwrap();
        r.add_or_refresh_mapping(external(4040), Protocol::Tcp, internal(4040), true, "mesh")
            .unwrap();

        assert_eq!(r.list_mappings().len(), 1);
    }

    #[test]
    fn test_same_port_different_protocol_coexist() {
        let r = registrar(Arc::new(TestGateway::default()));

        r.add_or_refresh_mapping(external(4040), Protocol::Tcp, internal(4040), true, "t")
            .unwrap();
        r.add_or_refresh_mapping(external(4040), Protocol::Udp, internal(4040), true, "u")
            .unwrap();

        assert_eq!(r.list_mappings().len(), 2);
    }

    #[test]
    fn test_gateway_failure_is_soft() {
        let r = registrar(Arc::new(TestGateway {
            fail: true,
            ..Default::default()
        }));

        let result =
            r.add_or_refresh_mapping(external(1), Protocol::Tcp, internal(1), true, "x");

        assert!(matches!(result, Err(MappingError::MappingFailed(_))));
        assert!(r.list_mappings().is_empty());
    }

    #[test]
    fn test_remove_mapping() {
        let r = registrar(Arc::new(TestGateway::default()));

        r.add_or_refresh_mapping(external(5), Protocol::Udp, internal(5), true, "x")
            .unwrap();

        assert!(r.remove_mapping(5, Protocol::Udp));
        assert!(!r.remove_mapping(5, Protocol::Udp));
        assert!(r.list_mappings().is_empty());

        let record = r.store.get(r.store.local_id()).unwrap();
        assert!(record.nat_gateways.get().is_empty());
    }

    #[test]
    fn test_disabled_mapping_not_advertised() {
        let r = registrar(Arc::new(TestGateway::default()));

        r.add_or_refresh_mapping(external(9), Protocol::Tcp, internal(9), false, "off")
            .unwrap();

        let record = r.store.get(r.store.local_id()).unwrap();
        assert!(record.nat_gateways.get().is_empty());
        assert_eq!(r.list_mappings().len(), 1);
    }
}
