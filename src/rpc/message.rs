//! RPC message framing.
//!
//! Three message kinds: `Request` (expects a `Response`), `Datagram`
//! (fire-and-forget, any return value is discarded) and `Response`
//! (return value or remote error). Arguments are explicitly typed by
//! name so that callers and callees built from different contract
//! versions can still talk.

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, DataFormatter, RpcValue};

/// Error raised by a remote method body, carried inside a `Response`.
///
/// Remote failures cross the wire as data, never as panics; the
/// caller-side binding is the only place that turns this back into an
/// error type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("remote call {contract}.{method} failed: {description}")]
pub struct RemoteMethodError {
    /// Contract the failing method belongs to
    pub contract: String,

    /// Failing method
    pub method: String,

    /// Description of the original error
    pub description: String,
}

/// One named, typed call argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Parameter name
    pub name: String,

    /// Wire-visible type name of the value
    pub type_name: String,

    /// Encoded value (produced by the injected codec)
    pub value: Vec<u8>,
}

impl Argument {
    /// Encode a value into a named argument.
    pub fn encode(
        name: &str,
        value: &RpcValue,
        formatter: &dyn DataFormatter,
    ) -> Result<Self, CodecError> {
        if !formatter.can_handle(value) {
            return Err(CodecError::Unsupported(value.type_name().to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            type_name: value.type_name().to_string(),
            value: formatter.encode_value(value)?,
        })
    }

    /// Decode the argument value.
    pub fn decode(&self, formatter: &dyn DataFormatter) -> Result<RpcValue, CodecError> {
        formatter.decode_value(&self.value)
    }
}

/// A method invocation sent to a remote peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Caller-side correlation id, unique per outstanding call
    pub call_id: u64,

    /// Target contract type name
    pub contract: String,

    /// Target method name
    pub method: String,

    /// Ordered argument list
    pub args: Vec<Argument>,
}

/// Outcome of a remote invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// Encoded return value (empty for void methods)
    Ok(Vec<u8>),

    /// The method body raised an error
    Err(RemoteMethodError),
}

/// Reply to a `Request`, correlated by call id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Correlation id of the request being answered
    pub call_id: u64,

    /// Return value or remote error
    pub outcome: CallOutcome,
}

/// RPC wire message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Two-way invocation
    Request(RequestMessage),

    /// One-way invocation, no response expected
    Datagram(RequestMessage),

    /// Reply to a request
    Response(ResponseMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeFormatter;

    #[test]
    fn test_argument_encode_decode() {
        let formatter = BincodeFormatter;
        let arg = Argument::encode("count", &RpcValue::I64(7), &formatter).unwrap();

        assert_eq!(arg.name, "count");
        assert_eq!(arg.type_name, "i64");
        assert_eq!(arg.decode(&formatter).unwrap(), RpcValue::I64(7));
    }

    #[test]
    fn test_message_round_trip() {
        let formatter = BincodeFormatter;
        let request = RpcMessage::Request(RequestMessage {
            call_id: 42,
            contract: "mesh.control".to_string(),
            method: "ping".to_string(),
            args: vec![Argument::encode("nonce", &RpcValue::U64(9), &formatter).unwrap()],
        });

        let bytes = bincode::serialize(&request).unwrap();
        let recovered: RpcMessage = bincode::deserialize(&bytes).unwrap();

        assert_eq!(recovered, request);
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteMethodError {
            contract: "c".to_string(),
            method: "m".to_string(),
            description: "boom".to_string(),
        };

        assert_eq!(err.to_string(), "remote call c.m failed: boom");
    }
}
