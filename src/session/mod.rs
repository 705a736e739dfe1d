//! Sessions and the shared message substrate.
//!
//! A session is a logical conversation between two peers multiplexed
//! over one transport connection. Gossip and RPC traffic ride the
//! same [`WireMessage`] channel; the topology layer does not own a
//! second transport.

pub mod framing;
pub mod manager;

pub use manager::{SessionConfig, SessionEvent, SessionManager};

use serde::{Deserialize, Serialize};

use crate::rpc::message::RpcMessage;
use crate::topology::RecordDelta;
use crate::types::{AddressEndPoint, PeerId};

/// Session-level failure taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// No listening endpoint or no live path to the peer
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    /// Connect/send deadline exceeded
    #[error("session operation timed out")]
    Timeout,

    /// The session was torn down mid-operation
    #[error("session closed")]
    SessionClosed,

    /// Underlying transport failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Handshake was refused by the remote side
    #[error("handshake rejected: {0}")]
    Rejected(String),
}

/// Opening handshake, sent by the dialing side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Dialer's peer id
    pub peer_id: PeerId,

    /// Dialer's protocol/software version
    pub version: String,

    /// Dialer's advertised listening endpoints
    pub servers: Vec<AddressEndPoint>,
}

/// Handshake acknowledgment, sent by the accepting side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelloAckMessage {
    /// Accept or reject
    pub accepted: bool,

    /// Rejection reason, if any
    pub reason: Option<String>,

    /// Acceptor's peer id
    pub peer_id: PeerId,

    /// Acceptor's protocol/software version
    pub version: String,

    /// Acceptor's advertised listening endpoints
    pub servers: Vec<AddressEndPoint>,
}

/// Everything that crosses a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    /// Opening handshake
    Hello(HelloMessage),

    /// Handshake acknowledgment
    HelloAck(HelloAckMessage),

    /// Topology delta
    Gossip(RecordDelta),

    /// RPC traffic
    Rpc(RpcMessage),

    /// Liveness probe, refreshes the idle deadline on both sides
    KeepAlive,
}

impl WireMessage {
    /// Serialize for framing.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Deserialize from a frame body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        bincode::deserialize(bytes).map_err(|e| SessionError::Transport(e.to_string()))
    }
}
