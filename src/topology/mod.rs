//! Topology state: versioned peer records, the reachability graph and
//! the gossip propagator that keeps every peer's view convergent.

pub mod blackhole;
pub mod gossip;
pub mod graph;
pub mod record;
pub mod store;

pub use blackhole::{BlackHoleConfig, BlackHoleDetector, ProbeState};
pub use gossip::{DeltaSink, GossipPropagator};
pub use graph::ReachabilityGraph;
pub use record::{
    BlackHoleState, DeltaPayload, PeerRecord, PeerRelation, RecordDelta, SubObjectKind,
    UpdateError, Versioned,
};
pub use store::PeerRecordStore;
