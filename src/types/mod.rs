//! Core type definitions for the Meshwork overlay.
//!
//! Identity and addressing value types used by every other component.
//! All of them are immutable, compare by value and serialize through
//! the codec boundary.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Monotonically increasing per-sub-object version counter.
///
/// Used for last-writer-wins conflict resolution: a receiver never
/// applies an update whose state id is less than or equal to the one
/// it already stores for that sub-object.
pub type StateId = u64;

/// Identifier of a logical session between two peers.
pub type SessionId = u64;

/// Stable identity of one participating process in the overlay.
///
/// Derived from application id, network context and host name; the
/// derivation is deterministic so a restarting peer keeps its identity.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derive a peer id from its identity-bearing parts.
    ///
    /// Format: `{context}/{host}/{hex8}` where `hex8` is the first
    /// 8 hex chars of sha256 over all three parts. The hash suffix
    /// keeps ids unique even when two applications share a host.
    pub fn derive(application_id: &str, network_context: &str, host_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(application_id.as_bytes());
        hasher.update(b"|");
        hasher.update(network_context.as_bytes());
        hasher.update(b"|");
        hasher.update(host_name.as_bytes());
        let digest = hasher.finalize();

        Self(format!(
            "{}/{}/{}",
            network_context,
            host_name,
            hex::encode(&digest[..4])
        ))
    }

    /// Wrap an already-formatted id (e.g. received over the wire).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The underlying id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Error parsing an `AddressEndPoint` from text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndPointParseError {
    /// The offending input
    pub input: String,

    /// Why parsing failed
    pub reason: String,
}

/// A network address as host + port.
///
/// Immutable, equality by value. The host is kept as a string because
/// the overlay routes by advertised names, not resolved addresses;
/// resolution happens at the transport boundary.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct AddressEndPoint {
    host: String,
    port: u16,
}

impl AddressEndPoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for AddressEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for AddressEndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddressEndPoint({}:{})", self.host, self.port)
    }
}

impl FromStr for AddressEndPoint {
    type Err = EndPointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| EndPointParseError {
            input: s.to_string(),
            reason: "missing ':' separator".to_string(),
        })?;

        if host.is_empty() {
            return Err(EndPointParseError {
                input: s.to_string(),
                reason: "empty host".to_string(),
            });
        }

        let port: u16 = port.parse().map_err(|_| EndPointParseError {
            input: s.to_string(),
            reason: "port out of range".to_string(),
        })?;

        Ok(Self::new(host, port))
    }
}
