//! Black-hole detection.
//!
//! A black hole is a peer with asymmetric reachability: connections to
//! it open, but traffic back never arrives (a pathology behind some
//! NATs and firewalls). The detector consumes round-trip probe results
//! and gossip asymmetry observations, runs a per-peer state machine
//! and flags confirmed black holes in the record store so routing
//! excludes them. Classification is advisory: it never tears down a
//! session.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::types::PeerId;

use super::record::RecordDelta;
use super::store::PeerRecordStore;
use std::sync::Arc;

/// Detector tunables.
///
/// Flagging on a single failure would flap on transient loss, so both
/// directions require a sustained window.
#[derive(Clone, Debug)]
pub struct BlackHoleConfig {
    /// Consecutive probe failures before flagging
    pub failure_threshold: u32,

    /// Consecutive probe successes before clearing
    pub recovery_threshold: u32,

    /// Delay between canary probes per neighbor
    pub probe_interval: Duration,

    /// How long to wait for a probe response
    pub probe_timeout: Duration,
}

impl Default for BlackHoleConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Per-peer probe state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    /// Never probed
    Unknown,
    /// Probing, no verdict yet
    Probing,
    /// Sustained successful window
    Clear,
    /// Confirmed asymmetric reachability
    BlackHole,
}

struct PeerProbe {
    state: ProbeState,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl PeerProbe {
    fn new() -> Self {
        Self {
            state: ProbeState::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Classifies peers by probe outcomes and marks black holes.
pub struct BlackHoleDetector {
    config: BlackHoleConfig,
    store: Arc<PeerRecordStore>,
    probes: RwLock<HashMap<PeerId, PeerProbe>>,
}

impl BlackHoleDetector {
    /// Create a detector over the given store.
    pub fn new(store: Arc<PeerRecordStore>, config: BlackHoleConfig) -> Self {
        Self {
            config,
            store,
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// Detector configuration.
    pub fn config(&self) -> &BlackHoleConfig {
        &self.config
    }

    /// Current classification of a peer.
    pub fn state(&self, peer: &PeerId) -> ProbeState {
        self.probes
            .read()
            .get(peer)
            .map(|p| p.state)
            .unwrap_or(ProbeState::Unknown)
    }

    /// A canary probe to `peer` round-tripped.
    ///
    /// Returns the black-hole delta to gossip when the peer just
    /// recovered from a black-hole verdict.
    pub fn record_success(&self, peer: &PeerId) -> Option<RecordDelta> {
        let cleared = {
            let mut probes = self.probes.write();
            let probe = probes.entry(peer.clone()).or_insert_with(PeerProbe::new);

            probe.consecutive_failures = 0;
            probe.consecutive_successes += 1;

            match probe.state {
                ProbeState::BlackHole => {
                    if probe.consecutive_successes >= self.config.recovery_threshold {
                        probe.state = ProbeState::Clear;
                        true
                    } else {
                        false
                    }
                }
                ProbeState::Unknown | ProbeState::Probing => {
                    if probe.consecutive_successes >= self.config.recovery_threshold {
                        probe.state = ProbeState::Clear;
                    } else {
                        probe.state = ProbeState::Probing;
                    }
                    false
                }
                ProbeState::Clear => false,
            }
        };

        if cleared {
            info!("peer {} recovered from black-hole state", peer);
            self.store.set_black_hole(peer, false)
        } else {
            None
        }
    }

    /// A canary probe to `peer` failed or timed out.
    ///
    /// Returns the black-hole delta to gossip when the failure window
    /// crossed the threshold.
    pub fn record_failure(&self, peer: &PeerId) -> Option<RecordDelta> {
        let flagged = {
            let mut probes = self.probes.write();
            let probe = probes.entry(peer.clone()).or_insert_with(PeerProbe::new);

            probe.consecutive_successes = 0;
            probe.consecutive_failures += 1;

            if probe.state != ProbeState::BlackHole
                && probe.consecutive_failures >= self.config.failure_threshold
            {
                probe.state = ProbeState::BlackHole;
                true
            } else {
                if probe.state == ProbeState::Unknown || probe.state == ProbeState::Clear {
                    probe.state = ProbeState::Probing;
                }
                false
            }
        };

        if flagged {
            info!("peer {} classified as black hole", peer);
            self.store.set_black_hole(peer, true)
        } else {
            None
        }
    }

    /// Gossip asymmetry input: `claimant` advertises a connected
    /// relation to us that we do not observe ourselves. Counts as one
    /// failure signal against the claimant.
    pub fn observe_claimed_relation(&self, claimant: &PeerId) -> Option<RecordDelta> {
        self.record_failure(claimant)
    }

    /// Drop probe state for a departed peer.
    pub fn forget(&self, peer: &PeerId) {
        self.probes.write().remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(name: &str) -> PeerId {
        PeerId::from_raw(name)
    }

    fn detector(failure_threshold: u32, recovery_threshold: u32) -> BlackHoleDetector {
        let store = Arc::new(PeerRecordStore::new(pid("self")));
        BlackHoleDetector::new(
            store,
            BlackHoleConfig {
                failure_threshold,
                recovery_threshold,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_single_failure_does_not_flag() {
        let d = detector(3, 2);

        assert!(d.record_failure(&pid("a")).is_none());
        assert_eq!(d.state(&pid("a")), ProbeState::Probing);
    }

    #[test]
    fn test_flag_after_threshold_failures() {
        let d = detector(3, 2);
        let peer = pid("a");

        assert!(d.record_failure(&peer).is_none());
        assert!(d.record_failure(&peer).is_none());
        let delta = d.record_failure(&peer).expect("third failure flags");

        assert_eq!(d.state(&peer), ProbeState::BlackHole);
        assert_eq!(delta.state_id, 1);
        assert!(d.store.get(&peer).unwrap().is_black_hole());

        // Further failures stay flagged without fresh deltas.
        assert!(d.record_failure(&peer).is_none());
    }

    #[test]
    fn test_recovery_requires_sustained_window() {
        let d = detector(2, 2);
        let peer = pid("a");

        d.record_failure(&peer);
        d.record_failure(&peer);
        assert_eq!(d.state(&peer), ProbeState::BlackHole);

        assert!(d.record_success(&peer).is_none());
        let delta = d.record_success(&peer).expect("second success clears");

        assert_eq!(d.state(&peer), ProbeState::Clear);
        assert_eq!(delta.state_id, 2);
        assert!(!d.store.get(&peer).unwrap().is_black_hole());
    }

    #[test]
    fn test_interleaved_results_reset_windows() {
        let d = detector(3, 2);
        let peer = pid("a");

        d.record_failure(&peer);
        d.record_failure(&peer);
        d.record_success(&peer); // resets the failure streak
        d.record_failure(&peer);
        d.record_failure(&peer);

        assert_eq!(d.state(&peer), ProbeState::Probing);
    }

    #[test]
    fn test_clear_peer_never_gossiped() {
        // A peer that was never flagged produces no deltas on success.
        let d = detector(3, 1);
        let peer = pid("a");

        assert!(d.record_success(&peer).is_none());
        assert_eq!(d.state(&peer), ProbeState::Clear);
        assert!(d.store.get(&peer).is_none());
    }

    #[test]
    fn test_asymmetry_observation_counts_as_failure() {
        let d = detector(2, 2);
        let peer = pid("a");

        d.observe_claimed_relation(&peer);
        let delta = d.observe_claimed_relation(&peer);

        assert!(delta.is_some());
        assert_eq!(d.state(&peer), ProbeState::BlackHole);
    }
}
