//! Caller-side call runtime.
//!
//! Correlates outbound requests with inbound responses by call id.
//! Every call resolves to a tagged outcome rather than a panic: remote
//! handler failures come back as [`CallError::Remote`], transport and
//! deadline failures as their own variants. Responses arriving after
//! their call timed out are discarded.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::{DataFormatter, RpcValue};
use crate::session::{SessionError, SessionManager, WireMessage};
use crate::types::{PeerId, SessionId};

use super::contract::{ContractRegistry, MethodAttributes};
use super::message::{
    Argument, CallOutcome, RemoteMethodError, RequestMessage, ResponseMessage, RpcMessage,
};

/// Caller-side failure taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// No route to the peer
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    /// Response deadline exceeded
    #[error("call timed out")]
    CallTimeout,

    /// The session died while the call was in flight
    #[error("session closed")]
    SessionClosed,

    /// Codec or transport failure before the call left this node
    #[error("call transport failure: {0}")]
    Transport(String),

    /// The remote handler reported an error
    #[error(transparent)]
    Remote(RemoteMethodError),
}

impl From<SessionError> for CallError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Unreachable(peer) => CallError::Unreachable(peer),
            SessionError::Timeout => CallError::CallTimeout,
            SessionError::SessionClosed => CallError::SessionClosed,
            SessionError::Transport(msg) => CallError::Transport(msg),
            SessionError::Rejected(msg) => CallError::Transport(msg),
        }
    }
}

struct PendingCall {
    session: SessionId,
    waiter: oneshot::Sender<ResponseMessage>,
}

/// Issues remote calls over established sessions.
pub struct RpcClient {
    sessions: Arc<SessionManager>,
    registry: Arc<ContractRegistry>,
    formatter: Arc<dyn DataFormatter>,
    default_timeout: Duration,

    next_call_id: AtomicU64,
    pending: DashMap<u64, PendingCall>,
}

impl RpcClient {
    /// Create a client over the shared session manager and registry.
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ContractRegistry>,
        formatter: Arc<dyn DataFormatter>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            formatter,
            default_timeout,
            next_call_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Invoke a contract method on a session.
    ///
    /// One-way methods return `RpcValue::Null` as soon as the message
    /// is queued; two-way methods block until the response arrives or
    /// the method's declared timeout expires.
    pub async fn call(
        &self,
        session: SessionId,
        contract: &str,
        method: &str,
        args: &[(&str, RpcValue)],
    ) -> Result<RpcValue, CallError> {
        let attrs = self
            .registry
            .attributes(contract, method)
            .unwrap_or_else(MethodAttributes::two_way);

        let mut encoded = Vec::with_capacity(args.len());
        for (name, value) in args {
            let arg = Argument::encode(name, value, self.formatter.as_ref())
                .map_err(|e| CallError::Transport(e.to_string()))?;
            encoded.push(arg);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let request = RequestMessage {
            call_id,
            contract: contract.to_string(),
            method: method.to_string(),
            args: encoded,
        };

        if attrs.one_way {
            let message = WireMessage::Rpc(RpcMessage::Datagram(request));
            if attrs.reliable {
                self.sessions.send_reliable(session, message).await?;
            } else {
                self.sessions.send(session, message).await?;
            }
            return Ok(RpcValue::Null);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(
            call_id,
            PendingCall {
                session,
                waiter: waiter_tx,
            },
        );

        let message = WireMessage::Rpc(RpcMessage::Request(request));
        let sent = if attrs.reliable {
            self.sessions.send_reliable(session, message).await
        } else {
            self.sessions.send(session, message).await
        };
        if let Err(e) = sent {
            self.pending.remove(&call_id);
            return Err(e.into());
        }

        let response = match attrs.timeout.resolve(self.default_timeout) {
            Some(deadline) => match tokio::time::timeout(deadline, waiter_rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Forget the waiter; a response arriving later is
                    // dropped by handle_response.
                    self.pending.remove(&call_id);
                    return Err(CallError::CallTimeout);
                }
            },
            None => waiter_rx.await,
        }
        .map_err(|_| CallError::SessionClosed)?;

        match response.outcome {
            CallOutcome::Ok(bytes) => self
                .formatter
                .decode_value(&bytes)
                .map_err(|e| CallError::Transport(e.to_string())),
            CallOutcome::Err(e) => Err(CallError::Remote(e)),
        }
    }

    /// Fire-and-forget invocation, regardless of declared attributes.
    ///
    /// Returns once the datagram is queued; the remote return value,
    /// if any, is discarded.
    pub async fn notify(
        &self,
        session: SessionId,
        contract: &str,
        method: &str,
        args: &[(&str, RpcValue)],
    ) -> Result<(), CallError> {
        let mut encoded = Vec::with_capacity(args.len());
        for (name, value) in args {
            let arg = Argument::encode(name, value, self.formatter.as_ref())
                .map_err(|e| CallError::Transport(e.to_string()))?;
            encoded.push(arg);
        }

        let request = RequestMessage {
            call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
            contract: contract.to_string(),
            method: method.to_string(),
            args: encoded,
        };

        self.sessions
            .send(session, WireMessage::Rpc(RpcMessage::Datagram(request)))
            .await?;
        Ok(())
    }

    /// Deliver an inbound response to its waiter.
    ///
    /// Responses with no waiter (timed out, session already failed)
    /// are logged and dropped.
    pub fn handle_response(&self, response: ResponseMessage) {
        match self.pending.remove(&response.call_id) {
            Some((_, call)) => {
                let _ = call.waiter.send(response);
            }
            None => debug!("late response for call {} discarded", response.call_id),
        }
    }

    /// Fail every in-flight call on a dead session.
    pub fn fail_session(&self, session: SessionId) {
        // Dropping the waiter resolves the call as SessionClosed.
        self.pending.retain(|_, call| call.session != session);
    }

    /// In-flight call count (diagnostics).
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}
