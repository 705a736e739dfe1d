//! Peer record data model.
//!
//! A [`PeerRecord`] describes everything the overlay knows about one
//! peer: identity, black-hole classification, NAT gateways, listening
//! servers and direct relations. Each sub-object is independently
//! versioned with a monotonically increasing state id, which is what
//! makes gossip order-tolerant: stale or duplicate updates compare
//! `<=` and are dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{AddressEndPoint, PeerId, StateId};

/// Rejected topology update.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpdateError {
    /// Relation with both endpoints equal
    #[error("self-referential relation for peer {0}")]
    SelfRelation(PeerId),

    /// Update payload did not match its sub-object kind or was empty
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
}

/// A sub-object value paired with its version counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    state_id: StateId,
    value: T,
}

impl<T> Versioned<T> {
    /// Wrap an initial value at state id 0 (meaning "never published").
    pub fn initial(value: T) -> Self {
        Self { state_id: 0, value }
    }

    /// Current state id.
    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    /// Current value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replace the value with a locally observed mutation, bumping the
    /// state id. Returns the new state id.
    pub fn bump(&mut self, value: T) -> StateId {
        self.state_id += 1;
        self.value = value;
        self.state_id
    }

    /// Apply a remote update if and only if its state id is strictly
    /// greater than the stored one. Equality means duplicate, not
    /// conflict; both equal and older updates are no-ops.
    pub fn try_apply(&mut self, state_id: StateId, value: T) -> bool {
        if state_id <= self.state_id {
            return false;
        }
        self.state_id = state_id;
        self.value = value;
        true
    }
}

/// Connectivity statement between exactly two peers.
///
/// Endpoints are normalized on construction so that `A↔B` and `B↔A`
/// refer to the same edge.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRelation {
    peer_a: PeerId,
    peer_b: PeerId,
    connected: bool,
}

impl PeerRelation {
    /// Create a relation; rejects self-loops.
    pub fn new(a: PeerId, b: PeerId, connected: bool) -> Result<Self, UpdateError> {
        if a == b {
            return Err(UpdateError::SelfRelation(a));
        }
        let (peer_a, peer_b) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self {
            peer_a,
            peer_b,
            connected,
        })
    }

    /// Lower endpoint (by id ordering).
    pub fn peer_a(&self) -> &PeerId {
        &self.peer_a
    }

    /// Higher endpoint (by id ordering).
    pub fn peer_b(&self) -> &PeerId {
        &self.peer_b
    }

    /// Whether the edge is currently believed connected.
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// True if this relation mentions the given peer.
    pub fn involves(&self, id: &PeerId) -> bool {
        &self.peer_a == id || &self.peer_b == id
    }

    /// The opposite endpoint, if this relation involves `id`.
    pub fn other(&self, id: &PeerId) -> Option<&PeerId> {
        if &self.peer_a == id {
            Some(&self.peer_b)
        } else if &self.peer_b == id {
            Some(&self.peer_a)
        } else {
            None
        }
    }

    /// True if both relations describe the same edge (ignoring state).
    pub fn same_edge(&self, other: &PeerRelation) -> bool {
        self.peer_a == other.peer_a && self.peer_b == other.peer_b
    }
}

/// Black-hole classification of a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackHoleState {
    /// Peer is reachable in one direction only and must be excluded
    /// from routing
    pub is_black_hole: bool,
}

/// Everything known about one peer, including ourselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable identity, primary key, never reused
    pub id: PeerId,

    /// Descriptive host name (not identity-bearing)
    pub host_name: String,

    /// Descriptive network context name (not identity-bearing)
    pub network_context: String,

    /// Protocol/software version, used for compatibility checks only
    pub version: String,

    /// Black-hole classification
    pub black_hole: Versioned<BlackHoleState>,

    /// Externally reachable NAT gateway endpoints
    pub nat_gateways: Versioned<Vec<AddressEndPoint>>,

    /// The peer's own listening endpoints, as seen from outside
    pub servers: Versioned<Vec<AddressEndPoint>>,

    /// Direct relations to other peers
    pub relations: Versioned<Vec<PeerRelation>>,
}

impl PeerRecord {
    /// Create a fresh record for a peer first mentioned by gossip or a
    /// direct connection. Host and context are recovered from the id
    /// format (`context/host/hash`) when possible.
    pub fn new(id: PeerId) -> Self {
        let (network_context, host_name) = match id.as_str().splitn(3, '/').collect::<Vec<_>>()[..]
        {
            [ctx, host, _] => (ctx.to_string(), host.to_string()),
            _ => ("unknown".to_string(), id.as_str().to_string()),
        };

        Self {
            id,
            host_name,
            network_context,
            version: String::new(),
            black_hole: Versioned::initial(BlackHoleState::default()),
            nat_gateways: Versioned::initial(Vec::new()),
            servers: Versioned::initial(Vec::new()),
            relations: Versioned::initial(Vec::new()),
        }
    }

    /// Whether this peer is currently classified as a black hole.
    pub fn is_black_hole(&self) -> bool {
        self.black_hole.get().is_black_hole
    }

    /// Relations currently believed connected.
    pub fn connected_relations(&self) -> impl Iterator<Item = &PeerRelation> {
        self.relations.get().iter().filter(|r| r.connected())
    }
}

/// Which sub-object of a peer record a delta targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubObjectKind {
    /// Black-hole classification
    BlackHole,
    /// NAT gateway list
    NatGateways,
    /// Listening server list
    Servers,
    /// Relation list
    Relations,
}

impl fmt::Display for SubObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubObjectKind::BlackHole => "black-hole",
            SubObjectKind::NatGateways => "nat-gateways",
            SubObjectKind::Servers => "servers",
            SubObjectKind::Relations => "relations",
        };
        f.write_str(name)
    }
}

/// Sub-object payload carried by a gossip delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeltaPayload {
    /// New black-hole classification
    BlackHole(BlackHoleState),
    /// New NAT gateway list
    NatGateways(Vec<AddressEndPoint>),
    /// New listening server list
    Servers(Vec<AddressEndPoint>),
    /// New relation list
    Relations(Vec<PeerRelation>),
}

impl DeltaPayload {
    /// The sub-object kind this payload belongs to.
    pub fn kind(&self) -> SubObjectKind {
        match self {
            DeltaPayload::BlackHole(_) => SubObjectKind::BlackHole,
            DeltaPayload::NatGateways(_) => SubObjectKind::NatGateways,
            DeltaPayload::Servers(_) => SubObjectKind::Servers,
            DeltaPayload::Relations(_) => SubObjectKind::Relations,
        }
    }
}

/// One gossiped sub-object update.
///
/// This is the gossip wire unit: sender, subject, sub-object kind (via
/// the payload tag), state id and payload. It round-trips through the
/// codec boundary like every other wire value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    /// Peer that forwarded this delta to us
    pub origin: PeerId,

    /// Peer whose record the delta mutates
    pub subject: PeerId,

    /// Version of the sub-object after the mutation
    pub state_id: StateId,

    /// The new sub-object value
    pub payload: DeltaPayload,
}

impl RecordDelta {
    /// The sub-object kind this delta targets.
    pub fn kind(&self) -> SubObjectKind {
        self.payload.kind()
    }

    /// Validate structural invariants before application.
    pub fn validate(&self) -> Result<(), UpdateError> {
        if let DeltaPayload::Relations(relations) = &self.payload {
            for relation in relations {
                if relation.peer_a() == relation.peer_b() {
                    return Err(UpdateError::SelfRelation(relation.peer_a().clone()));
                }
            }
        }
        if self.state_id == 0 {
            return Err(UpdateError::MalformedUpdate(
                "state id 0 is reserved for unpublished sub-objects".to_string(),
            ));
        }
        Ok(())
    }
}
