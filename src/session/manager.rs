//! Session lifecycle and transport multiplexing.
//!
//! Owns the physical connections to neighbors and multiplexes logical
//! sessions over them. Each session gets its own reader, writer and
//! keep-alive task; messages within a session are delivered in send
//! order (FIFO through the writer queue), while no ordering holds
//! across sessions.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::topology::PeerRecordStore;
use crate::types::{AddressEndPoint, PeerId, SessionId};

use super::framing::{read_frame, write_frame};
use super::{HelloAckMessage, HelloMessage, SessionError, WireMessage};

/// Session manager tunables.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// TCP connect deadline
    pub connect_timeout: Duration,

    /// Handshake exchange deadline
    pub handshake_timeout: Duration,

    /// Keep-alive send interval
    pub keep_alive_interval: Duration,

    /// A session with no inbound activity past this deadline is
    /// closed and reported down
    pub idle_deadline: Duration,

    /// Maximum frame size (bytes)
    pub max_frame_size: usize,

    /// Per-session outbound queue depth
    pub send_queue_depth: usize,

    /// Transport send attempts for reliable delivery
    pub reliable_attempts: u32,

    /// Maximum concurrent sessions; further inbound handshakes are
    /// rejected
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(10),
            idle_deadline: Duration::from_secs(45),
            max_frame_size: 16 * 1024 * 1024, // 16 MB
            send_queue_depth: 1024,
            reliable_attempts: 3,
            max_sessions: 50,
        }
    }
}

/// Session lifecycle and traffic notifications, consumed by the node's
/// demux loop and forwarded to external subscribers.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed; the session is usable
    Up {
        /// New session id
        session: SessionId,
        /// Remote peer
        peer: PeerId,
    },

    /// The session was closed or its transport failed
    Down {
        /// Closed session id
        session: SessionId,
        /// Remote peer
        peer: PeerId,
    },

    /// An application message arrived
    Message {
        /// Originating session
        session: SessionId,
        /// Remote peer
        peer: PeerId,
        /// The message
        message: WireMessage,
    },
}

struct SessionHandle {
    peer: PeerId,
    sender: mpsc::Sender<WireMessage>,
    last_activity: Arc<Mutex<Instant>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns transport connections and maps sessions to peers.
pub struct SessionManager {
    local_id: PeerId,
    version: String,
    advertised: Vec<AddressEndPoint>,
    config: SessionConfig,
    store: Arc<PeerRecordStore>,

    next_session_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    by_peer: RwLock<HashMap<PeerId, SessionId>>,

    /// Endpoints learned from handshakes, used as dial fallbacks when
    /// gossip has not yet delivered the peer's server list
    endpoint_hints: RwLock<HashMap<PeerId, Vec<AddressEndPoint>>>,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: RwLock<Option<mpsc::Receiver<SessionEvent>>>,
}

impl SessionManager {
    /// Create a manager for the local peer.
    pub fn new(
        local_id: PeerId,
        version: String,
        advertised: Vec<AddressEndPoint>,
        store: Arc<PeerRecordStore>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(4096);

        Self {
            local_id,
            version,
            advertised,
            config,
            store,
            next_session_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            by_peer: RwLock::new(HashMap::new()),
            endpoint_hints: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: RwLock::new(Some(events_rx)),
        }
    }

    /// Take the event receiver (once).
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.write().take()
    }

    /// Our peer id.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Live session to a peer, if any.
    pub fn session_for_peer(&self, peer: &PeerId) -> Option<SessionId> {
        self.by_peer.read().get(peer).copied()
    }

    /// Remote peer of a session.
    pub fn peer_of(&self, session: SessionId) -> Option<PeerId> {
        self.sessions.read().get(&session).map(|h| h.peer.clone())
    }

    /// Dial an endpoint and perform the active handshake.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &AddressEndPoint,
    ) -> Result<SessionId, SessionError> {
        let addr = endpoint.to_string();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        self.handshake_active(stream).await
    }

    async fn handshake_active(
        self: &Arc<Self>,
        mut stream: TcpStream,
    ) -> Result<SessionId, SessionError> {
        let hello = WireMessage::Hello(HelloMessage {
            peer_id: self.local_id.clone(),
            version: self.version.clone(),
            servers: self.advertised.clone(),
        });
        write_frame(&mut stream, &hello.to_bytes()?)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let frame = tokio::time::timeout(
            self.config.handshake_timeout,
            read_frame(&mut stream, self.config.max_frame_size),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

        let ack = match WireMessage::from_bytes(&frame)? {
            WireMessage::HelloAck(ack) => ack,
            other => {
                return Err(SessionError::Transport(format!(
                    "expected HelloAck, got {:?}",
                    other
                )))
            }
        };

        if !ack.accepted {
            return Err(SessionError::Rejected(
                ack.reason.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }

        Ok(self
            .register_session(ack.peer_id, ack.version, ack.servers, stream)
            .await)
    }

    async fn handshake_passive(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), SessionError> {
        let frame = tokio::time::timeout(
            self.config.handshake_timeout,
            read_frame(&mut stream, self.config.max_frame_size),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

        let hello = match WireMessage::from_bytes(&frame)? {
            WireMessage::Hello(hello) => hello,
            other => {
                return Err(SessionError::Transport(format!(
                    "expected Hello, got {:?}",
                    other
                )))
            }
        };

        let (accepted, reason) = if hello.peer_id == self.local_id {
            (false, Some("self connection".to_string()))
        } else if self.session_count() >= self.config.max_sessions {
            (false, Some("session limit reached".to_string()))
        } else {
            (true, None)
        };

        let ack = WireMessage::HelloAck(HelloAckMessage {
            accepted,
            reason: reason.clone(),
            peer_id: self.local_id.clone(),
            version: self.version.clone(),
            servers: self.advertised.clone(),
        });
        write_frame(&mut stream, &ack.to_bytes()?)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        if !accepted {
            return Err(SessionError::Rejected(reason.unwrap_or_default()));
        }

        self.register_session(hello.peer_id, hello.version, hello.servers, stream)
            .await;
        Ok(())
    }

    /// Accept inbound connections forever.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.handshake_passive(stream).await {
                            debug!("inbound handshake from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn register_session(
        self: &Arc<Self>,
        peer: PeerId,
        version: String,
        servers: Vec<AddressEndPoint>,
        stream: TcpStream,
    ) -> SessionId {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        self.store.touch(&peer);
        self.store.set_peer_version(&peer, &version);
        if !servers.is_empty() {
            self.endpoint_hints.write().insert(peer.clone(), servers);
        }

        let (reader_half, writer_half) = stream.into_split();
        let (sender, mut outbound_rx) = mpsc::channel::<WireMessage>(self.config.send_queue_depth);
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        {
            let mut sessions = self.sessions.write();
            sessions.insert(
                id,
                SessionHandle {
                    peer: peer.clone(),
                    sender: sender.clone(),
                    last_activity: Arc::clone(&last_activity),
                    tasks: Vec::new(),
                },
            );
        }
        self.by_peer.write().insert(peer.clone(), id);

        // Writer task: drains the FIFO queue onto the socket.
        let writer_task = tokio::spawn(async move {
            let mut writer = writer_half;
            while let Some(message) = outbound_rx.recv().await {
                let bytes = match message.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("dropping unencodable message: {}", e);
                        continue;
                    }
                };
                if write_frame(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: frames in, events out, cleanup on EOF/error.
        let manager = Arc::clone(self);
        let reader_peer = peer.clone();
        let activity = Arc::clone(&last_activity);
        let max_frame = self.config.max_frame_size;
        let reader_task = tokio::spawn(async move {
            let mut reader = reader_half;
            loop {
                let frame = match read_frame(&mut reader, max_frame).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let message = match WireMessage::from_bytes(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("undecodable frame from {}: {}", reader_peer, e);
                        continue;
                    }
                };

                *activity.lock() = Instant::now();
                manager.store.touch(&reader_peer);

                if matches!(message, WireMessage::KeepAlive) {
                    continue;
                }

                let _ = manager
                    .events_tx
                    .send(SessionEvent::Message {
                        session: id,
                        peer: reader_peer.clone(),
                        message,
                    })
                    .await;
            }
            manager.finish_session(id).await;
        });

        // Keep-alive task: periodic probe, idle-deadline enforcement.
        let manager = Arc::clone(self);
        let ka_sender = sender;
        let ka_activity = last_activity;
        let interval = self.config.keep_alive_interval;
        let deadline = self.config.idle_deadline;
        let keep_alive_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let idle = ka_activity.lock().elapsed();
                if idle > deadline {
                    info!("session {} idle for {:?}, closing", id, idle);
                    manager.close_session(id).await;
                    break;
                }

                if ka_sender.send(WireMessage::KeepAlive).await.is_err() {
                    break;
                }
            }
        });

        if let Some(handle) = self.sessions.write().get_mut(&id) {
            handle.tasks = vec![writer_task, reader_task, keep_alive_task];
        }

        info!("session {} up with {}", id, peer);
        let _ = self
            .events_tx
            .send(SessionEvent::Up {
                session: id,
                peer,
            })
            .await;

        id
    }

    /// Open (or reuse) a session to a peer.
    ///
    /// Reuses a live session when one exists; otherwise resolves the
    /// peer's listening endpoints from the record store (servers, then
    /// NAT gateways, then handshake hints) and dials them in order.
    pub async fn open_session(self: &Arc<Self>, peer: &PeerId) -> Result<SessionId, SessionError> {
        if let Some(id) = self.session_for_peer(peer) {
            return Ok(id);
        }

        let candidates = self.dial_candidates(peer);
        if candidates.is_empty() {
            return Err(SessionError::Unreachable(peer.clone()));
        }

        for endpoint in candidates {
            match self.connect(&endpoint).await {
                Ok(id) => {
                    if self.peer_of(id).as_ref() == Some(peer) {
                        return Ok(id);
                    }
                    // A different peer answered at that address; keep
                    // the session but keep looking.
                    debug!("unexpected peer at {}, wanted {}", endpoint, peer);
                }
                Err(e) => debug!("dial {} failed: {}", endpoint, e),
            }
        }

        Err(SessionError::Unreachable(peer.clone()))
    }

    /// Dial order for a peer: gossiped servers, then NAT gateways,
    /// then handshake hints. An endpoint known through several sources
    /// is dialed once.
    fn dial_candidates(&self, peer: &PeerId) -> Vec<AddressEndPoint> {
        let mut candidates: Vec<AddressEndPoint> = Vec::new();
        if let Some(record) = self.store.get(peer) {
            candidates.extend(record.servers.get().iter().cloned());
            candidates.extend(record.nat_gateways.get().iter().cloned());
        }
        if let Some(hints) = self.endpoint_hints.read().get(peer) {
            candidates.extend(hints.iter().cloned());
        }

        let mut seen = HashSet::new();
        candidates.retain(|endpoint| seen.insert(endpoint.clone()));
        candidates
    }

    /// Queue a message on a session (FIFO per session).
    pub async fn send(&self, session: SessionId, message: WireMessage) -> Result<(), SessionError> {
        let sender = self
            .sessions
            .read()
            .get(&session)
            .map(|h| h.sender.clone())
            .ok_or(SessionError::SessionClosed)?;

        sender
            .send(message)
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    /// `send` with bounded retries, for methods declared reliable.
    pub async fn send_reliable(
        &self,
        session: SessionId,
        message: WireMessage,
    ) -> Result<(), SessionError> {
        let attempts = self.config.reliable_attempts.max(1);
        let mut last_err = SessionError::SessionClosed;

        for attempt in 0..attempts {
            match self.send(session, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("reliable send attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                }
            }
            tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt + 1))).await;
        }

        Err(last_err)
    }

    /// Close a session, cancelling its tasks and reporting it down.
    pub async fn close_session(&self, session: SessionId) {
        if let Some(handle) = self.finish_session(session).await {
            for task in handle.tasks {
                task.abort();
            }
        }
    }

    /// Remove a session from the maps and emit `Down` exactly once.
    async fn finish_session(&self, session: SessionId) -> Option<SessionHandle> {
        let handle = self.sessions.write().remove(&session)?;

        {
            let mut by_peer = self.by_peer.write();
            if by_peer.get(&handle.peer) == Some(&session) {
                by_peer.remove(&handle.peer);
            }
        }

        info!("session {} with {} down", session, handle.peer);
        let _ = self
            .events_tx
            .send(SessionEvent::Down {
                session,
                peer: handle.peer.clone(),
            })
            .await;

        Some(handle)
    }

    /// Close every session (node shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        for id in ids {
            self.close_session(id).await;
        }
    }
}
