//! Concurrent peer record store.
//!
//! The single shared data structure mutated from multiple contexts:
//! inbound gossip streams call [`PeerRecordStore::upsert`] while local
//! detectors mutate the self record. All writes funnel through the
//! per-record map entry, so readers never wait longer than a shard
//! lookup.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::types::{AddressEndPoint, PeerId};

use super::record::{
    BlackHoleState, DeltaPayload, PeerRecord, PeerRelation, RecordDelta, UpdateError,
};

/// Thread-safe store of every known peer record, keyed by peer id.
pub struct PeerRecordStore {
    /// Our own peer id; the self record lives in `records` like any other
    local_id: PeerId,

    /// Records indexed by id
    records: DashMap<PeerId, PeerRecord>,

    /// Last activity per record, for staleness collection
    touched: DashMap<PeerId, Instant>,
}

impl PeerRecordStore {
    /// Create a store seeded with the local peer's own record.
    pub fn new(local_id: PeerId) -> Self {
        let store = Self {
            local_id: local_id.clone(),
            records: DashMap::new(),
            touched: DashMap::new(),
        };
        store
            .records
            .insert(local_id.clone(), PeerRecord::new(local_id.clone()));
        store.touched.insert(local_id, Instant::now());
        store
    }

    /// Our own peer id.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Get a copy of a peer's record.
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Whether a record exists for the given peer.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of known records (including self).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when only the self record is known.
    pub fn is_empty(&self) -> bool {
        self.records.len() <= 1
    }

    /// Record activity for a peer (defers staleness collection).
    pub fn touch(&self, id: &PeerId) {
        self.touched.insert(id.clone(), Instant::now());
    }

    /// Apply a remote sub-object update.
    ///
    /// Returns `Ok(true)` iff the update was strictly newer and was
    /// applied; stale and duplicate updates return `Ok(false)` so that
    /// out-of-order delivery is harmless. Malformed updates are
    /// rejected without touching any state.
    pub fn upsert(&self, delta: &RecordDelta) -> Result<bool, UpdateError> {
        delta.validate()?;

        let mut record = self
            .records
            .entry(delta.subject.clone())
            .or_insert_with(|| PeerRecord::new(delta.subject.clone()));

        let applied = match &delta.payload {
            DeltaPayload::BlackHole(state) => {
                record.black_hole.try_apply(delta.state_id, *state)
            }
            DeltaPayload::NatGateways(gateways) => record
                .nat_gateways
                .try_apply(delta.state_id, gateways.clone()),
            DeltaPayload::Servers(servers) => {
                record.servers.try_apply(delta.state_id, servers.clone())
            }
            DeltaPayload::Relations(relations) => record
                .relations
                .try_apply(delta.state_id, relations.clone()),
        };
        drop(record);

        if applied {
            self.touch(&delta.subject);
        }
        Ok(applied)
    }

    /// Consistent point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// The snapshot expressed as deltas, for full sync on join.
    ///
    /// Sub-objects still at state id 0 were never published and are
    /// skipped; a receiver could not apply them anyway.
    pub fn snapshot_deltas(&self) -> Vec<RecordDelta> {
        let mut deltas = Vec::new();

        for record in self.records.iter() {
            let subject = record.id.clone();

            if record.black_hole.state_id() > 0 {
                deltas.push(RecordDelta {
                    origin: self.local_id.clone(),
                    subject: subject.clone(),
                    state_id: record.black_hole.state_id(),
                    payload: DeltaPayload::BlackHole(*record.black_hole.get()),
                });
            }
            if record.nat_gateways.state_id() > 0 {
                deltas.push(RecordDelta {
                    origin: self.local_id.clone(),
                    subject: subject.clone(),
                    state_id: record.nat_gateways.state_id(),
                    payload: DeltaPayload::NatGateways(record.nat_gateways.get().clone()),
                });
            }
            if record.servers.state_id() > 0 {
                deltas.push(RecordDelta {
                    origin: self.local_id.clone(),
                    subject: subject.clone(),
                    state_id: record.servers.state_id(),
                    payload: DeltaPayload::Servers(record.servers.get().clone()),
                });
            }
            if record.relations.state_id() > 0 {
                deltas.push(RecordDelta {
                    origin: self.local_id.clone(),
                    subject,
                    state_id: record.relations.state_id(),
                    payload: DeltaPayload::Relations(record.relations.get().clone()),
                });
            }
        }

        deltas
    }

    /// Set the protocol version learned from a peer's handshake.
    /// Descriptive only, not versioned, not gossiped.
    pub fn set_peer_version(&self, id: &PeerId, version: &str) {
        let mut record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()));
        record.version = version.to_string();
    }

    // === Local mutators ===
    //
    // Each one bumps the sub-object's state id and returns the
    // resulting delta for the gossip propagator to flood.

    /// Record a black-hole classification for a peer.
    ///
    /// Returns `None` when the classification did not change.
    pub fn set_black_hole(&self, id: &PeerId, is_black_hole: bool) -> Option<RecordDelta> {
        let mut record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()));

        if record.black_hole.get().is_black_hole == is_black_hole
            && record.black_hole.state_id() > 0
        {
            return None;
        }

        let state = BlackHoleState { is_black_hole };
        let state_id = record.black_hole.bump(state);

        Some(RecordDelta {
            origin: self.local_id.clone(),
            subject: id.clone(),
            state_id,
            payload: DeltaPayload::BlackHole(state),
        })
    }

    /// Replace the local peer's NAT gateway list.
    pub fn set_nat_gateways(&self, gateways: Vec<AddressEndPoint>) -> RecordDelta {
        let mut record = self
            .records
            .get_mut(&self.local_id)
            .expect("self record always present");

        let state_id = record.nat_gateways.bump(gateways.clone());

        RecordDelta {
            origin: self.local_id.clone(),
            subject: self.local_id.clone(),
            state_id,
            payload: DeltaPayload::NatGateways(gateways),
        }
    }

    /// Replace the local peer's listening server list.
    pub fn set_servers(&self, servers: Vec<AddressEndPoint>) -> RecordDelta {
        let mut record = self
            .records
            .get_mut(&self.local_id)
            .expect("self record always present");

        let state_id = record.servers.bump(servers.clone());

        RecordDelta {
            origin: self.local_id.clone(),
            subject: self.local_id.clone(),
            state_id,
            payload: DeltaPayload::Servers(servers),
        }
    }

    /// Update the local peer's relation to another peer.
    ///
    /// Disconnections are expressed as `connected = false` rather than
    /// deletions; staleness collection reclaims fully dark records.
    pub fn set_relation(
        &self,
        other: &PeerId,
        connected: bool,
    ) -> Result<RecordDelta, UpdateError> {
        let relation = PeerRelation::new(self.local_id.clone(), other.clone(), connected)?;

        let mut record = self
            .records
            .get_mut(&self.local_id)
            .expect("self record always present");

        let mut relations = record.relations.get().clone();
        match relations.iter_mut().find(|r| r.same_edge(&relation)) {
            Some(existing) => *existing = relation,
            None => relations.push(relation),
        }

        let state_id = record.relations.bump(relations.clone());

        Ok(RecordDelta {
            origin: self.local_id.clone(),
            subject: self.local_id.clone(),
            state_id,
            payload: DeltaPayload::Relations(relations),
        })
    }

    /// Remove records that have been dark past the grace period.
    ///
    /// A record is reclaimable when no `connected = true` relation
    /// anywhere in the store mentions it and it has not been touched
    /// within `grace`. Removal is a local decision and is never
    /// gossiped.
    pub fn prune_stale(&self, grace: Duration) -> Vec<PeerId> {
        let mut mentioned = std::collections::HashSet::new();
        for record in self.records.iter() {
            for relation in record.connected_relations() {
                mentioned.insert(relation.peer_a().clone());
                mentioned.insert(relation.peer_b().clone());
            }
        }

        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .records
            .iter()
            .filter(|r| r.id != self.local_id && !mentioned.contains(&r.id))
            .filter(|r| {
                self.touched
                    .get(&r.id)
                    .map(|t| now.duration_since(*t) > grace)
                    .unwrap_or(true)
            })
            .map(|r| r.id.clone())
            .collect();

        for id in &stale {
            self.records.remove(id);
            self.touched.remove(id);
        }

        stale
    }
}
