//! Reachability graph derived from peer records.
//!
//! Nodes are peer ids, edges are `connected = true` relations from any
//! record. The graph is undirected for traversal; peers flagged as
//! black holes are excluded entirely, even when a live edge points at
//! them.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::PeerId;

use super::record::PeerRecord;
use super::store::PeerRecordStore;

/// Point-in-time adjacency view over the record store.
pub struct ReachabilityGraph {
    adjacency: HashMap<PeerId, HashSet<PeerId>>,
    black_holes: HashSet<PeerId>,
}

impl ReachabilityGraph {
    /// Build the graph from a snapshot of the store.
    pub fn from_store(store: &PeerRecordStore) -> Self {
        Self::from_records(&store.snapshot())
    }

    /// Build the graph from a set of records.
    pub fn from_records(records: &[PeerRecord]) -> Self {
        let mut adjacency: HashMap<PeerId, HashSet<PeerId>> = HashMap::new();
        let mut black_holes = HashSet::new();

        for record in records {
            if record.is_black_hole() {
                black_holes.insert(record.id.clone());
            }

            for relation in record.connected_relations() {
                adjacency
                    .entry(relation.peer_a().clone())
                    .or_default()
                    .insert(relation.peer_b().clone());
                adjacency
                    .entry(relation.peer_b().clone())
                    .or_default()
                    .insert(relation.peer_a().clone());
            }
        }

        Self {
            adjacency,
            black_holes,
        }
    }

    /// Whether a path of connected, non-black-hole peers exists.
    pub fn is_reachable(&self, from: &PeerId, to: &PeerId) -> bool {
        if from == to {
            return !self.black_holes.contains(from);
        }
        self.reachable_set(from).contains(to)
    }

    /// Every peer reachable from `from` (excluding `from` itself).
    ///
    /// BFS over the adjacency map, skipping black-holed peers; a
    /// black-holed start yields the empty set.
    pub fn reachable_set(&self, from: &PeerId) -> HashSet<PeerId> {
        let mut reached = HashSet::new();
        if self.black_holes.contains(from) {
            return reached;
        }

        let mut queue = VecDeque::new();
        queue.push_back(from.clone());
        let mut visited: HashSet<PeerId> = HashSet::new();
        visited.insert(from.clone());

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(&current) {
                for neighbor in neighbors {
                    if visited.contains(neighbor) || self.black_holes.contains(neighbor) {
                        continue;
                    }
                    visited.insert(neighbor.clone());
                    reached.insert(neighbor.clone());
                    queue.push_back(neighbor.clone());
                }
            }
        }

        reached
    }

    /// Direct neighbors of a peer (ignores black-hole flags).
    pub fn neighbors(&self, id: &PeerId) -> Vec<PeerId> {
        self.adjacency
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of peers with at least one connected edge.
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::record::{DeltaPayload, RecordDelta};
    use crate::topology::store::PeerRecordStore;
    use crate::types::PeerId;

    fn pid(name: &str) -> PeerId {
        PeerId::from_raw(name)
    }

    fn relation_delta(subject: &str, state_id: u64, edges: &[(&str, &str)]) -> RecordDelta {
        let relations = edges
            .iter()
            .map(|(a, b)| {
                crate::topology::record::PeerRelation::new(pid(a), pid(b), true).unwrap()
            })
            .collect();

        RecordDelta {
            origin: pid(subject),
            subject: pid(subject),
            state_id,
            payload: DeltaPayload::Relations(relations),
        }
    }

    #[test]
    fn test_transitive_reachability() {
        let store = PeerRecordStore::new(pid("a"));
        store.upsert(&relation_delta("a", 1, &[("a", "b")])).unwrap();
        store.upsert(&relation_delta("b", 1, &[("b", "c")])).unwrap();

        let graph = ReachabilityGraph::from_store(&store);

        assert!(graph.is_reachable(&pid("a"), &pid("c")));
        assert!(graph.is_reachable(&pid("c"), &pid("a")));
        assert!(!graph.is_reachable(&pid("a"), &pid("d")));
    }

    #[test]
    fn test_black_hole_excluded_despite_live_edge() {
        let store = PeerRecordStore::new(pid("a"));
        store.upsert(&relation_delta("a", 1, &[("a", "b")])).unwrap();
        store.set_black_hole(&pid("b"), true);

        let graph = ReachabilityGraph::from_store(&store);

        assert!(!graph.is_reachable(&pid("a"), &pid("b")));
    }

    #[test]
    fn test_black_hole_does_not_forward() {
        // a - bh - c: the black hole must not carry traffic between
        // its neighbors.
        let store = PeerRecordStore::new(pid("a"));
        store
            .upsert(&relation_delta("bh", 1, &[("a", "bh"), ("bh", "c")]))
            .unwrap();
        store.set_black_hole(&pid("bh"), true);

        let graph = ReachabilityGraph::from_store(&store);

        assert!(!graph.is_reachable(&pid("a"), &pid("c")));
    }

    #[test]
    fn test_disconnected_edge_ignored() {
        let store = PeerRecordStore::new(pid("a"));
        store.set_relation(&pid("b"), false).unwrap();

        let graph = ReachabilityGraph::from_store(&store);

        assert!(!graph.is_reachable(&pid("a"), &pid("b")));
    }
}
