//! Serialization boundary.
//!
//! Gossip payloads and RPC parameters cross the wire through an
//! injected [`DataFormatter`], never through a hard-coded format.
//! The default formatter is bincode-backed; alternative codecs only
//! need to round-trip [`RpcValue`].

use serde::{Deserialize, Serialize};

/// Codec failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Value could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// The formatter does not support this value shape
    #[error("unsupported value: {0}")]
    Unsupported(String),
}

/// Self-describing value carried as an RPC argument or return value.
///
/// Keeping arguments as tagged values (instead of raw struct bytes)
/// is what makes cross-version calls tolerant: a callee can inspect
/// what it was given before binding it to a parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    /// No value (void returns, null arguments)
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    I64(i64),
    /// Unsigned integer
    U64(u64),
    /// Floating point
    F64(f64),
    /// UTF-8 string
    Str(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Ordered list of values
    List(Vec<RpcValue>),
}

impl RpcValue {
    /// Wire-visible type name, recorded next to every argument.
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcValue::Null => "null",
            RpcValue::Bool(_) => "bool",
            RpcValue::I64(_) => "i64",
            RpcValue::U64(_) => "u64",
            RpcValue::F64(_) => "f64",
            RpcValue::Str(_) => "string",
            RpcValue::Bytes(_) => "bytes",
            RpcValue::List(_) => "list",
        }
    }

    /// Extract a bool, if this value is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract a signed integer, if this value is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract a string slice, if this value is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Injected codec used by both the gossip and RPC layers.
pub trait DataFormatter: Send + Sync {
    /// Serialize a value to bytes.
    fn encode_value(&self, value: &RpcValue) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a value from bytes.
    fn decode_value(&self, bytes: &[u8]) -> Result<RpcValue, CodecError>;

    /// Probe whether this formatter can represent the given value.
    fn can_handle(&self, value: &RpcValue) -> bool;
}

/// Default formatter: bincode over the serde model.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeFormatter;

impl DataFormatter for BincodeFormatter {
    fn encode_value(&self, value: &RpcValue) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<RpcValue, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn can_handle(&self, _value: &RpcValue) -> bool {
        // bincode covers the whole RpcValue model
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let formatter = BincodeFormatter;
        let value = RpcValue::List(vec![
            RpcValue::I64(1),
            RpcValue::Str("2".to_string()),
            RpcValue::Bool(false),
        ]);

        assert!(formatter.can_handle(&value));

        let bytes = formatter.encode_value(&value).unwrap();
        let recovered = formatter.decode_value(&bytes).unwrap();

        assert_eq!(recovered, value);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let formatter = BincodeFormatter;

        assert!(formatter.decode_value(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(RpcValue::Null.type_name(), "null");
        assert_eq!(RpcValue::Str(String::new()).type_name(), "string");
        assert_eq!(RpcValue::I64(0).type_name(), "i64");
    }
}
