//! Node event bus.
//!
//! Applications observe the mesh through subscriptions rather than by
//! polling the record store. Callbacks run inline on the node's event
//! loop and must not block.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::topology::SubObjectKind;
use crate::types::{PeerId, SessionId};

/// Externally observable mesh changes.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// A direct session to a peer came up
    ConnectionUp {
        /// The peer
        peer: PeerId,
        /// The new session
        session: SessionId,
    },

    /// A direct session to a peer went down
    ConnectionDown {
        /// The peer
        peer: PeerId,
        /// The closed session
        session: SessionId,
    },

    /// A peer record sub-object changed (local or gossiped)
    PeerRecordChanged {
        /// Record subject
        peer: PeerId,
        /// Which sub-object changed
        kind: SubObjectKind,
    },

    /// A peer's black-hole classification changed
    BlackHoleChanged {
        /// The peer
        peer: PeerId,
        /// New classification
        black_hole: bool,
    },
}

/// Subscription handle, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventCallback = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

/// Fan-out of [`MeshEvent`]s to registered callbacks.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriptionId, EventCallback>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every future event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().insert(id, Arc::new(callback));
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to every subscriber.
    pub fn publish(&self, event: &MeshEvent) {
        let callbacks: Vec<EventCallback> = self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_publish() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        bus.subscribe(move |event| {
            if matches!(event, MeshEvent::ConnectionUp { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(&MeshEvent::ConnectionUp {
            peer: PeerId::from_raw("a"),
            session: 1,
        });
        bus.publish(&MeshEvent::ConnectionDown {
            peer: PeerId::from_raw("a"),
            session: 1,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&MeshEvent::ConnectionUp {
            peer: PeerId::from_raw("a"),
            session: 1,
        });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&MeshEvent::ConnectionUp {
            peer: PeerId::from_raw("a"),
            session: 1,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_all_notified() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&seen);
            bus.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(&MeshEvent::BlackHoleChanged {
            peer: PeerId::from_raw("x"),
            black_hole: true,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
