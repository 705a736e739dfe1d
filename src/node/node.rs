//! Mesh node wiring.
//!
//! Composes the record store, gossip propagator, black-hole detector,
//! session manager and RPC runtime into one running peer. The demux
//! loop is the only consumer of session events; everything else hangs
//! off it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{BincodeFormatter, DataFormatter, RpcValue};
use crate::nat::{NatRegistrar, NullGateway};
use crate::rpc::{
    handler, CallError, CallTimeout, ContractDescriptor, ContractRegistry, MethodAttributes,
    MethodHandler, RpcClient, RpcDispatcher, RpcMessage,
};
use crate::session::{SessionEvent, SessionManager, WireMessage};
use crate::topology::{
    BlackHoleDetector, DeltaPayload, DeltaSink, GossipPropagator, PeerRecordStore,
    ReachabilityGraph, RecordDelta,
};
use crate::types::{AddressEndPoint, PeerId, SessionId};

use super::config::NodeConfig;
use super::events::{EventBus, MeshEvent, SubscriptionId};

/// Node state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Node is starting up
    Starting,

    /// Running and serving sessions
    Running,

    /// Shutting down
    Stopping,

    /// Stopped
    Stopped,
}

/// Point-in-time operational counters.
#[derive(Clone, Debug)]
pub struct NodeStats {
    pub known_records: usize,
    pub live_sessions: usize,
    pub pending_calls: usize,
    pub neighbors: usize,
}

/// Name of the built-in control contract every node hosts.
pub const CONTROL_CONTRACT: &str = "mesh.control";

/// Bridges gossip output onto live sessions.
struct SessionDeltaSink {
    sessions: Arc<SessionManager>,
}

impl DeltaSink for SessionDeltaSink {
    fn send_delta(&self, neighbor: &PeerId, delta: &RecordDelta) {
        let Some(session) = self.sessions.session_for_peer(neighbor) else {
            debug!("no live session to {}, delta dropped", neighbor);
            return;
        };

        let sessions = Arc::clone(&self.sessions);
        let message = WireMessage::Gossip(delta.clone());
        tokio::spawn(async move {
            if let Err(e) = sessions.send(session, message).await {
                debug!("gossip send on session {} failed: {}", session, e);
            }
        });
    }
}

/// A running mesh peer.
pub struct MeshNode {
    /// Configuration
    config: NodeConfig,

    /// Current state
    state: RwLock<NodeState>,

    /// Our peer id
    peer_id: PeerId,

    /// Endpoints we advertise
    advertised: Vec<AddressEndPoint>,

    /// Shared record store
    store: Arc<PeerRecordStore>,

    /// Gossip propagator
    propagator: Arc<GossipPropagator>,

    /// Black-hole detector
    detector: Arc<BlackHoleDetector>,

    /// Session manager
    sessions: Arc<SessionManager>,

    /// Hosted contract registry
    registry: Arc<ContractRegistry>,

    /// Inbound RPC dispatch
    dispatcher: Arc<RpcDispatcher>,

    /// Outbound RPC runtime
    client: Arc<RpcClient>,

    /// NAT gateway registrar
    nat: Arc<NatRegistrar>,

    /// Application event bus
    events: Arc<EventBus>,

    /// Shutdown signal
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Mutex<Option<mpsc::Receiver<()>>>,

    /// Background loops, aborted on shutdown
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshNode {
    /// Create a node from configuration. Nothing runs until
    /// [`MeshNode::start`].
    pub fn new(config: NodeConfig) -> Self {
        let peer_id = config.identity.peer_id();
        let advertised = Self::advertised_endpoints(&config);

        let store = Arc::new(PeerRecordStore::new(peer_id.clone()));

        let sessions = Arc::new(SessionManager::new(
            peer_id.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            advertised.clone(),
            Arc::clone(&store),
            config.network.session_config(),
        ));

        let sink = Arc::new(SessionDeltaSink {
            sessions: Arc::clone(&sessions),
        });
        let propagator = Arc::new(GossipPropagator::new(Arc::clone(&store), sink));

        let detector = Arc::new(BlackHoleDetector::new(
            Arc::clone(&store),
            config.black_hole.detector_config(),
        ));

        let formatter: Arc<dyn DataFormatter> = Arc::new(BincodeFormatter);
        let registry = Arc::new(ContractRegistry::new());
        let dispatcher = Arc::new(RpcDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&formatter),
        ));
        let client = Arc::new(RpcClient::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            formatter,
            config.rpc.default_timeout(),
        ));

        let nat = Arc::new(NatRegistrar::new(
            Arc::new(NullGateway),
            Arc::clone(&store),
            Arc::clone(&propagator),
        ));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let node = Self {
            state: RwLock::new(NodeState::Starting),
            peer_id,
            advertised,
            store,
            propagator,
            detector,
            sessions,
            registry,
            dispatcher,
            client,
            nat,
            events: Arc::new(EventBus::new()),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        node.register_control_contract();
        node
    }

    fn advertised_endpoints(config: &NodeConfig) -> Vec<AddressEndPoint> {
        let mut endpoints = Vec::new();
        for entry in &config.network.advertised {
            match entry.parse::<AddressEndPoint>() {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!("ignoring advertised endpoint '{}': {}", entry, e),
            }
        }

        if endpoints.is_empty() {
            endpoints.push(AddressEndPoint::new(
                &config.network.listen_host,
                config.network.listen_port,
            ));
        }
        endpoints
    }

    /// Every node answers control pings; the black-hole prober uses
    /// them as its canary.
    fn register_control_contract(&self) {
        let descriptor = ContractDescriptor::new(CONTROL_CONTRACT).method(
            "ping",
            MethodAttributes::two_way()
                .with_timeout(CallTimeout::Millis(self.config.black_hole.probe_timeout_ms)),
        );

        let mut handlers: HashMap<String, MethodHandler> = HashMap::new();
        handlers.insert(
            "ping".to_string(),
            handler(|_args| Ok(RpcValue::Str("pong".to_string()))),
        );

        self.registry.register_contract(descriptor, handlers);
    }

    /// Current node state.
    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Our peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The shared record store.
    pub fn store(&self) -> &Arc<PeerRecordStore> {
        &self.store
    }

    /// The NAT registrar.
    pub fn nat(&self) -> &Arc<NatRegistrar> {
        &self.nat
    }

    /// Operational counters.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            known_records: self.store.len(),
            live_sessions: self.sessions.session_count(),
            pending_calls: self.client.pending_calls(),
            neighbors: self.propagator.neighbors().len(),
        }
    }

    /// Host a contract implementation on this node.
    pub fn host_contract(
        &self,
        descriptor: ContractDescriptor,
        handlers: HashMap<String, MethodHandler>,
    ) {
        self.registry.register_contract(descriptor, handlers);
    }

    /// Subscribe to mesh events.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Invoke a contract method on a remote peer.
    ///
    /// Resolves reachability from the record store first: peers that
    /// are unknown, disconnected or flagged as black holes fail fast
    /// with [`CallError::Unreachable`] instead of a dial timeout.
    pub async fn call_peer(
        &self,
        peer: &PeerId,
        contract: &str,
        method: &str,
        args: &[(&str, RpcValue)],
    ) -> Result<RpcValue, CallError> {
        let session = match self.sessions.session_for_peer(peer) {
            Some(session) => session,
            None => {
                let graph = ReachabilityGraph::from_store(&self.store);
                if !graph.is_reachable(&self.peer_id, peer) {
                    return Err(CallError::Unreachable(peer.clone()));
                }
                self.sessions.open_session(peer).await?
            }
        };

        self.client.call(session, contract, method, args).await
    }

    /// Start the node and block until shutdown.
    pub async fn start(self: Arc<Self>) -> Result<(), String> {
        info!("starting mesh node {}", self.peer_id);

        // Advertise our listening endpoints before anyone connects.
        let delta = self.store.set_servers(self.advertised.clone());
        self.propagator.publish_local(delta);

        let listen_addr = format!(
            "{}:{}",
            self.config.network.listen_host, self.config.network.listen_port
        );
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", listen_addr, e))?;
        let listen_task = tokio::spawn(Arc::clone(&self.sessions).listen(listener));

        // Demux loop: the sole consumer of session events.
        let node = Arc::clone(&self);
        let demux_task = tokio::spawn(async move {
            node.handle_session_events().await;
        });

        self.connect_bootstrap_peers().await;

        // Canary probe loop.
        let node = Arc::clone(&self);
        let probe_task = tokio::spawn(async move {
            node.probe_loop().await;
        });

        // Staleness collection loop.
        let node = Arc::clone(&self);
        let prune_task = tokio::spawn(async move {
            node.prune_loop().await;
        });

        self.tasks
            .lock()
            .extend([listen_task, demux_task, probe_task, prune_task]);

        *self.state.write() = NodeState::Running;

        // Wait for shutdown signal.
        let receiver = self.shutdown_rx.lock().take();
        if let Some(mut rx) = receiver {
            let _ = rx.recv().await;
            info!("shutting down node {}", self.peer_id);
        }

        // Stop every background loop before tearing sessions down; the
        // aborted tasks release their handles on the node.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.sessions.shutdown().await;
        *self.state.write() = NodeState::Stopped;
        Ok(())
    }

    /// Stop the node.
    pub async fn stop(&self) {
        *self.state.write() = NodeState::Stopping;
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn connect_bootstrap_peers(&self) {
        for entry in &self.config.network.bootstrap_peers {
            let endpoint = match entry.parse::<AddressEndPoint>() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("ignoring bootstrap peer '{}': {}", entry, e);
                    continue;
                }
            };

            // Retry connection up to 5 times
            for attempt in 0..5 {
                match self.sessions.connect(&endpoint).await {
                    Ok(_) => {
                        info!("connected to bootstrap peer {}", endpoint);
                        break;
                    }
                    Err(e) => {
                        if attempt == 4 {
                            warn!("failed to connect to bootstrap peer {}: {}", endpoint, e);
                        } else {
                            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_session_events(&self) {
        let mut events = match self.sessions.take_events() {
            Some(events) => events,
            None => {
                warn!("session events already taken");
                return;
            }
        };

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Up { session, peer } => {
                    self.handle_session_up(session, peer);
                }
                SessionEvent::Down { session, peer } => {
                    self.handle_session_down(session, peer);
                }
                SessionEvent::Message {
                    session,
                    peer,
                    message,
                } => {
                    self.handle_message(session, peer, message).await;
                }
            }
        }
    }

    fn handle_session_up(&self, session: SessionId, peer: PeerId) {
        self.propagator.neighbor_up(&peer);
        self.events
            .publish(&MeshEvent::ConnectionUp { peer, session });
    }

    fn handle_session_down(&self, session: SessionId, peer: PeerId) {
        self.client.fail_session(session);
        self.registry.forget_session(session);

        // Simultaneous dials can leave two sessions to the same peer.
        // The peer only leaves the neighbor set once no session to it
        // remains, otherwise gossip over the surviving session stalls.
        if self.sessions.session_for_peer(&peer).is_none() {
            self.propagator.neighbor_down(&peer);
            self.detector.forget(&peer);
        }

        self.events
            .publish(&MeshEvent::ConnectionDown { peer, session });
    }

    async fn handle_message(&self, session: SessionId, peer: PeerId, message: WireMessage) {
        match message {
            WireMessage::Gossip(delta) => {
                let subject = delta.subject.clone();
                let kind = delta.kind();
                let black_hole = match &delta.payload {
                    DeltaPayload::BlackHole(state) => Some(state.is_black_hole),
                    _ => None,
                };

                if self.propagator.handle_remote(&peer, &delta) {
                    self.events.publish(&MeshEvent::PeerRecordChanged {
                        peer: subject.clone(),
                        kind,
                    });
                    if let Some(black_hole) = black_hole {
                        self.events.publish(&MeshEvent::BlackHoleChanged {
                            peer: subject.clone(),
                            black_hole,
                        });
                    }
                    self.check_claimed_relations(&delta);
                }
            }
            WireMessage::Rpc(rpc) => {
                if let RpcMessage::Response(response) = rpc {
                    self.client.handle_response(response);
                    return;
                }

                if let Some(response) = self.dispatcher.dispatch(session, &rpc) {
                    let reply = WireMessage::Rpc(RpcMessage::Response(response));
                    if let Err(e) = self.sessions.send(session, reply).await {
                        debug!("response send on session {} failed: {}", session, e);
                    }
                }
            }
            // Handshake frames never appear after registration.
            WireMessage::Hello(_) | WireMessage::HelloAck(_) => {
                debug!("unexpected handshake frame from {}", peer);
            }
            WireMessage::KeepAlive => {}
        }
    }

    /// Asymmetry input for the black-hole detector: a remote record
    /// claims a live relation to us, but we see no session to that
    /// peer. That is the signature of traffic vanishing on the way
    /// back and counts as one failure signal against the claimant.
    fn check_claimed_relations(&self, delta: &RecordDelta) {
        let DeltaPayload::Relations(relations) = &delta.payload else {
            return;
        };
        if delta.subject == self.peer_id {
            return;
        }

        let claims_us = relations
            .iter()
            .any(|r| r.connected() && r.involves(&self.peer_id));
        if !claims_us || self.sessions.session_for_peer(&delta.subject).is_some() {
            return;
        }

        if let Some(verdict) = self.detector.observe_claimed_relation(&delta.subject) {
            let black_hole = matches!(
                &verdict.payload,
                DeltaPayload::BlackHole(state) if state.is_black_hole
            );
            self.propagator.publish_local(verdict);
            self.events.publish(&MeshEvent::BlackHoleChanged {
                peer: delta.subject.clone(),
                black_hole,
            });
        }
    }

    /// Periodically ping every neighbor and feed the verdicts to the
    /// black-hole detector. Verdict changes are gossiped and surfaced
    /// as events.
    async fn probe_loop(&self) {
        let mut ticker = tokio::time::interval(self.detector.config().probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.state() != NodeState::Running {
                continue;
            }

            for neighbor in self.propagator.neighbors() {
                let Some(session) = self.sessions.session_for_peer(&neighbor) else {
                    continue;
                };

                let outcome = self
                    .client
                    .call(session, CONTROL_CONTRACT, "ping", &[])
                    .await;

                let delta = match outcome {
                    Ok(_) => self.detector.record_success(&neighbor),
                    Err(e) => {
                        debug!("probe to {} failed: {}", neighbor, e);
                        self.detector.record_failure(&neighbor)
                    }
                };

                if let Some(delta) = delta {
                    let black_hole = matches!(
                        &delta.payload,
                        DeltaPayload::BlackHole(state) if state.is_black_hole
                    );
                    self.propagator.publish_local(delta);
                    self.events.publish(&MeshEvent::BlackHoleChanged {
                        peer: neighbor.clone(),
                        black_hole,
                    });
                }
            }
        }
    }

    /// Periodically reclaim records nobody references anymore.
    async fn prune_loop(&self) {
        let grace = std::time::Duration::from_secs(self.config.gossip.prune_grace_secs);
        let interval = std::time::Duration::from_secs(self.config.gossip.prune_interval_secs);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let pruned = self.store.prune_stale(grace);
            if !pruned.is_empty() {
                info!("pruned {} stale peer records", pruned.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.identity.host_name = "test-host".to_string();
        config
    }

    #[test]
    fn test_node_creation() {
        let node = MeshNode::new(test_config());

        assert_eq!(node.state(), NodeState::Starting);
        assert!(node.peer_id().as_str().contains("test-host"));
        assert!(node.store().contains(node.peer_id()));
    }

    #[test]
    fn test_control_contract_registered() {
        let node = MeshNode::new(test_config());

        let attrs = node
            .registry
            .attributes(CONTROL_CONTRACT, "ping")
            .expect("control contract must be hosted");
        assert!(!attrs.one_way);
    }

    #[test]
    fn test_initial_stats() {
        let node = MeshNode::new(test_config());
        let stats = node.stats();

        assert_eq!(stats.known_records, 1);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pending_calls, 0);
        assert_eq!(stats.neighbors, 0);
    }

    #[test]
    fn test_advertised_falls_back_to_listen_address() {
        let mut config = test_config();
        config.network.listen_host = "10.0.0.7".to_string();
        config.network.listen_port = 9000;
        config.network.advertised = vec!["bogus".to_string()];

        let endpoints = MeshNode::advertised_endpoints(&config);
        assert_eq!(endpoints, vec![AddressEndPoint::new("10.0.0.7", 9000)]);
    }

    async fn listening_manager(name: &str) -> (Arc<SessionManager>, AddressEndPoint) {
        let peer = PeerId::from_raw(name);
        let store = Arc::new(PeerRecordStore::new(peer.clone()));
        let manager = Arc::new(SessionManager::new(
            peer,
            "0.1.0".to_string(),
            vec![],
            store,
            crate::session::SessionConfig::default(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(Arc::clone(&manager).listen(listener));
        (manager, AddressEndPoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_peer_stays_neighbor_while_second_session_lives() {
        let (_server, addr) = listening_manager("srv").await;
        let node = MeshNode::new(test_config());

        // Two dials to the same peer, as happens when both sides
        // bootstrap each other at the same time.
        let first = node.sessions.connect(&addr).await.unwrap();
        let second = node.sessions.connect(&addr).await.unwrap();
        assert_ne!(first, second);
        let peer = PeerId::from_raw("srv");

        node.handle_session_up(first, peer.clone());
        node.handle_session_up(second, peer.clone());
        assert!(node.propagator.neighbors().contains(&peer));

        // One session dies; the peer is still connected through the
        // survivor and must stay in the neighbor set.
        node.sessions.close_session(first).await;
        node.handle_session_down(first, peer.clone());
        assert!(node.propagator.neighbors().contains(&peer));

        // Once the last session goes, the peer leaves the set.
        node.sessions.close_session(second).await;
        node.handle_session_down(second, peer.clone());
        assert!(!node.propagator.neighbors().contains(&peer));
    }

    #[tokio::test]
    async fn test_call_unknown_peer_fails_fast() {
        let node = MeshNode::new(test_config());

        let result = node
            .call_peer(&PeerId::from_raw("nobody"), CONTROL_CONTRACT, "ping", &[])
            .await;

        assert!(matches!(result, Err(CallError::Unreachable(_))));
    }
}
