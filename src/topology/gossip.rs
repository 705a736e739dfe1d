//! Gossip propagation of peer record deltas.
//!
//! Anti-entropy on join (one full snapshot to every new neighbor),
//! delta flooding afterwards. Re-forwarding happens only for deltas
//! the local store actually applied, which bounds traffic to
//! O(changes x neighbors) instead of O(changes x peers^2).

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::PeerId;

use super::record::RecordDelta;
use super::store::PeerRecordStore;

/// Outbound path for a delta addressed to one neighbor.
///
/// The node wires this to the session manager; tests wire it to an
/// in-memory router. Delivery is best-effort: gossip tolerates loss
/// because every delta is re-derivable from a later full sync.
pub trait DeltaSink: Send + Sync {
    /// Queue a delta for delivery to a directly connected neighbor.
    fn send_delta(&self, neighbor: &PeerId, delta: &RecordDelta);
}

/// Keeps the local record store convergent with every reachable peer.
pub struct GossipPropagator {
    /// Shared record store
    store: Arc<PeerRecordStore>,

    /// Outbound delta path
    sink: Arc<dyn DeltaSink>,

    /// Currently connected neighbors
    neighbors: RwLock<HashSet<PeerId>>,
}

impl GossipPropagator {
    /// Create a propagator over the given store and sink.
    pub fn new(store: Arc<PeerRecordStore>, sink: Arc<dyn DeltaSink>) -> Self {
        Self {
            store,
            sink,
            neighbors: RwLock::new(HashSet::new()),
        }
    }

    /// Currently connected neighbors.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.neighbors.read().iter().cloned().collect()
    }

    /// A direct connection to `neighbor` came up.
    ///
    /// Marks the relation connected, floods that change, then sends
    /// the neighbor one full snapshot so it can catch up regardless of
    /// what it missed while disconnected.
    pub fn neighbor_up(&self, neighbor: &PeerId) {
        self.neighbors.write().insert(neighbor.clone());

        match self.store.set_relation(neighbor, true) {
            Ok(delta) => self.publish_local(delta),
            Err(e) => {
                warn!("refusing relation to {}: {}", neighbor, e);
                return;
            }
        }

        for delta in self.store.snapshot_deltas() {
            self.sink.send_delta(neighbor, &delta);
        }
    }

    /// A direct connection to `neighbor` went down.
    pub fn neighbor_down(&self, neighbor: &PeerId) {
        self.neighbors.write().remove(neighbor);

        match self.store.set_relation(neighbor, false) {
            Ok(delta) => self.publish_local(delta),
            Err(e) => warn!("refusing relation to {}: {}", neighbor, e),
        }
    }

    /// Flood a locally originated delta to every neighbor.
    pub fn publish_local(&self, delta: RecordDelta) {
        let targets = self.neighbors();
        for neighbor in targets {
            self.sink.send_delta(&neighbor, &delta);
        }
    }

    /// Handle a delta received from a neighbor.
    ///
    /// Applies it to the store; if (and only if) the store accepted it
    /// as new, re-broadcasts it to every other neighbor. Malformed
    /// deltas are logged and dropped without aborting the stream.
    /// Returns whether the delta changed local state.
    pub fn handle_remote(&self, from: &PeerId, delta: &RecordDelta) -> bool {
        let applied = match self.store.upsert(delta) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("rejected gossip from {}: {}", from, e);
                return false;
            }
        };

        if !applied {
            debug!(
                "suppressed stale {} delta for {} (state id {})",
                delta.kind(),
                delta.subject,
                delta.state_id
            );
            return false;
        }

        // Forward with ourselves as the sender.
        let forwarded = RecordDelta {
            origin: self.store.local_id().clone(),
            ..delta.clone()
        };

        let targets: Vec<PeerId> = self
            .neighbors
            .read()
            .iter()
            .filter(|n| *n != from)
            .cloned()
            .collect();

        for neighbor in targets {
            self.sink.send_delta(&neighbor, &forwarded);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::graph::ReachabilityGraph;
    use crate::topology::record::{DeltaPayload, PeerRelation};
    use crate::types::AddressEndPoint;
    use parking_lot::RwLock as PlRwLock;
    use std::collections::HashMap;

    fn pid(name: &str) -> PeerId {
        PeerId::from_raw(name)
    }

    /// Synchronous in-memory mesh: delivers each delta straight into
    /// the target propagator, letting floods recurse until suppressed.
    #[derive(Default)]
    struct MemoryRouter {
        nodes: PlRwLock<HashMap<PeerId, Arc<GossipPropagator>>>,
    }

    impl MemoryRouter {
        fn register(&self, id: PeerId, node: Arc<GossipPropagator>) {
            self.nodes.write().insert(id, node);
        }
    }

    impl DeltaSink for MemoryRouter {
        fn send_delta(&self, neighbor: &PeerId, delta: &RecordDelta) {
            let target = self.nodes.read().get(neighbor).cloned();
            if let Some(target) = target {
                target.handle_remote(&delta.origin, delta);
            }
        }
    }

    /// Build a mesh of propagators and connect the given edges.
    fn build_mesh(
        names: &[&str],
        edges: &[(&str, &str)],
    ) -> HashMap<PeerId, (Arc<PeerRecordStore>, Arc<GossipPropagator>)> {
        let router = Arc::new(MemoryRouter::default());
        let mut mesh = HashMap::new();

        for name in names {
            let store = Arc::new(PeerRecordStore::new(pid(name)));
            let propagator = Arc::new(GossipPropagator::new(
                Arc::clone(&store),
                router.clone() as Arc<dyn DeltaSink>,
            ));
            router.register(pid(name), Arc::clone(&propagator));
            mesh.insert(pid(name), (store, propagator));
        }

        for (a, b) in edges {
            mesh[&pid(a)].1.neighbor_up(&pid(b));
            mesh[&pid(b)].1.neighbor_up(&pid(a));
        }

        mesh
    }

    #[test]
    fn test_full_sync_on_join() {
        let mesh = build_mesh(&["a", "b"], &[]);

        // a learns something before b connects.
        let (store_a, prop_a) = &mesh[&pid("a")];
        let delta = store_a.set_servers(vec![AddressEndPoint::new("a", 1)]);
        prop_a.publish_local(delta);

        prop_a.neighbor_up(&pid("b"));
        mesh[&pid("b")].1.neighbor_up(&pid("a"));

        let view = mesh[&pid("b")].0.get(&pid("a")).unwrap();
        assert_eq!(view.servers.get().len(), 1);
    }

    #[test]
    fn test_convergence_across_line_topology() {
        // a - b - c - d: a change at either end must reach the other.
        let mesh = build_mesh(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "d")],
        );

        let (store_a, prop_a) = &mesh[&pid("a")];
        let delta = store_a.set_servers(vec![AddressEndPoint::new("a", 9)]);
        prop_a.publish_local(delta);

        for (_, (store, _)) in &mesh {
            let view = store.get(&pid("a")).unwrap();
            assert_eq!(view.servers.get().len(), 1, "a's servers not propagated");
        }

        // Every node computes the same reachability answers.
        for (_, (store, _)) in &mesh {
            let graph = ReachabilityGraph::from_store(store);
            assert!(graph.is_reachable(&pid("a"), &pid("d")));
            assert!(graph.is_reachable(&pid("d"), &pid("b")));
        }
    }

    #[test]
    fn test_flood_suppression_in_cycle() {
        // A cycle would loop forever without applied-change
        // suppression; reaching this assertion proves termination.
        let mesh = build_mesh(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);

        let (store_a, prop_a) = &mesh[&pid("a")];
        let delta = store_a.set_servers(vec![AddressEndPoint::new("a", 2)]);
        prop_a.publish_local(delta);

        for (_, (store, _)) in &mesh {
            assert_eq!(store.get(&pid("a")).unwrap().servers.get().len(), 1);
        }
    }

    #[test]
    fn test_malformed_delta_dropped_not_fatal() {
        let mesh = build_mesh(&["a", "b"], &[("a", "b")]);
        let (_, prop_b) = &mesh[&pid("b")];

        let json = r#"{"peer_a":"x","peer_b":"x","connected":true}"#;
        let bad_relation: PeerRelation = serde_json::from_str(json).unwrap();
        let bad = RecordDelta {
            origin: pid("a"),
            subject: pid("x"),
            state_id: 1,
            payload: DeltaPayload::Relations(vec![bad_relation]),
        };

        assert!(!prop_b.handle_remote(&pid("a"), &bad));

        // The stream is still usable afterwards.
        let good = RecordDelta {
            origin: pid("a"),
            subject: pid("y"),
            state_id: 1,
            payload: DeltaPayload::Servers(vec![AddressEndPoint::new("y", 1)]),
        };
        assert!(prop_b.handle_remote(&pid("a"), &good));
    }

    #[test]
    fn test_disconnect_gossips_connected_false() {
        let mesh = build_mesh(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);

        mesh[&pid("b")].1.neighbor_down(&pid("c"));

        // a hears about it through b and drops c from its view of
        // reachability via b.
        let store_a = &mesh[&pid("a")].0;
        let b_record = store_a.get(&pid("b")).unwrap();
        let edge = b_record
            .relations
            .get()
            .iter()
            .find(|r| r.involves(&pid("c")))
            .unwrap();
        assert!(!edge.connected());
    }
}
