//! Callee-side dispatch.
//!
//! Demultiplexes inbound `Request`/`Datagram` messages to registered
//! contract implementations. Handler errors are caught at this
//! boundary and travel back inside the `Response`; only `Request`s
//! get a reply, datagram return values are discarded.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{DataFormatter, RpcValue};
use crate::types::SessionId;

use super::contract::ContractRegistry;
use super::message::{
    CallOutcome, RemoteMethodError, RequestMessage, ResponseMessage, RpcMessage,
};

/// Resolves and invokes local contract implementations.
pub struct RpcDispatcher {
    registry: Arc<ContractRegistry>,
    formatter: Arc<dyn DataFormatter>,
}

impl RpcDispatcher {
    /// Create a dispatcher over the shared registry and codec.
    pub fn new(registry: Arc<ContractRegistry>, formatter: Arc<dyn DataFormatter>) -> Self {
        Self {
            registry,
            formatter,
        }
    }

    /// The shared registry (for hosting contracts).
    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    /// Handle one inbound RPC message.
    ///
    /// Returns the response to send back, if any. `Response` messages
    /// are not ours to handle (the proxy runtime correlates those) and
    /// yield `None`.
    pub fn dispatch(&self, session: SessionId, message: &RpcMessage) -> Option<ResponseMessage> {
        match message {
            RpcMessage::Request(request) => Some(ResponseMessage {
                call_id: request.call_id,
                outcome: self.invoke(session, request),
            }),
            RpcMessage::Datagram(request) => {
                // Invoke for effect; any return value is discarded.
                if let CallOutcome::Err(e) = self.invoke(session, request) {
                    debug!("datagram {}.{} failed: {}", request.contract, request.method, e);
                }
                None
            }
            RpcMessage::Response(_) => None,
        }
    }

    fn invoke(&self, session: SessionId, request: &RequestMessage) -> CallOutcome {
        let resolved = self
            .registry
            .resolve(session, &request.contract, &request.method);

        let handler = match resolved {
            Some((_attrs, Some(handler))) => handler,
            Some((_attrs, None)) => {
                return CallOutcome::Err(RemoteMethodError {
                    contract: request.contract.clone(),
                    method: request.method.clone(),
                    description: "method declared but not implemented".to_string(),
                });
            }
            None => {
                warn!(
                    "no implementation for {}.{} on session {}",
                    request.contract, request.method, session
                );
                return CallOutcome::Err(RemoteMethodError {
                    contract: request.contract.clone(),
                    method: request.method.clone(),
                    description: "unknown contract or method".to_string(),
                });
            }
        };

        // Decode arguments up front; a caller from another contract
        // version may send values we cannot read.
        let mut args = Vec::with_capacity(request.args.len());
        for arg in &request.args {
            match arg.decode(self.formatter.as_ref()) {
                Ok(value) => args.push(value),
                Err(e) => {
                    return CallOutcome::Err(RemoteMethodError {
                        contract: request.contract.clone(),
                        method: request.method.clone(),
                        description: format!("argument '{}' undecodable: {}", arg.name, e),
                    });
                }
            }
        }

        match handler(&args) {
            Ok(value) => match self.formatter.encode_value(&value) {
                Ok(bytes) => CallOutcome::Ok(bytes),
                Err(e) => CallOutcome::Err(RemoteMethodError {
                    contract: request.contract.clone(),
                    method: request.method.clone(),
                    description: format!("return value unencodable: {}", e),
                }),
            },
            Err(e) => CallOutcome::Err(e),
        }
    }

    /// Decode an outcome back into a value (caller-side helper).
    pub fn decode_outcome(&self, outcome: &CallOutcome) -> Result<RpcValue, RemoteMethodError> {
        match outcome {
            CallOutcome::Ok(bytes) => {
                self.formatter
                    .decode_value(bytes)
                    .map_err(|e| RemoteMethodError {
                        contract: String::new(),
                        method: String::new(),
                        description: format!("response undecodable: {}", e),
                    })
            }
            CallOutcome::Err(e) => Err(e.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeFormatter;
    use crate::rpc::contract::{handler, ContractDescriptor, MethodAttributes};
    use crate::rpc::message::Argument;
    use std::collections::HashMap;

    fn dispatcher_with_calc() -> RpcDispatcher {
        let registry = Arc::new(ContractRegistry::new());
        let formatter: Arc<dyn DataFormatter> = Arc::new(BincodeFormatter);

        let descriptor = ContractDescriptor::new("test.calc")
            .method("accepts", MethodAttributes::two_way())
            .method("fails", MethodAttributes::two_way())
            .method("record", MethodAttributes::one_way());

        let mut handlers = HashMap::new();
        // Mirrors the canonical round trip: called with (1, "2"),
        // returns false.
        handlers.insert(
            "accepts".to_string(),
            handler(|args| {
                let matched = args.len() == 2
                    && args[0].as_i64() == Some(1)
                    && args[1].as_str() == Some("2");
                Ok(RpcValue::Bool(!matched))
            }),
        );
        handlers.insert(
            "fails".to_string(),
            handler(|_args| {
                Err(RemoteMethodError {
                    contract: "test.calc".to_string(),
                    method: "fails".to_string(),
                    description: "intentional failure".to_string(),
                })
            }),
        );
        handlers.insert("record".to_string(), handler(|_args| Ok(RpcValue::Null)));

        registry.register_contract(descriptor, handlers);
        RpcDispatcher::new(registry, formatter)
    }

    fn encoded_args(values: &[(&str, RpcValue)]) -> Vec<Argument> {
        let formatter = BincodeFormatter;
        values
            .iter()
            .map(|(name, value)| Argument::encode(name, value, &formatter).unwrap())
            .collect()
    }

    #[test]
    fn test_request_round_trip() {
        let dispatcher = dispatcher_with_calc();
        let request = RpcMessage::Request(RequestMessage {
            call_id: 1,
            contract: "test.calc".to_string(),
            method: "accepts".to_string(),
            args: encoded_args(&[
                ("a", RpcValue::I64(1)),
                ("b", RpcValue::Str("2".to_string())),
            ]),
        });

        let response = dispatcher.dispatch(5, &request).unwrap();
        assert_eq!(response.call_id, 1);

        let value = dispatcher.decode_outcome(&response.outcome).unwrap();
        assert_eq!(value, RpcValue::Bool(false));
    }

    #[test]
    fn test_handler_error_wrapped_not_thrown() {
        let dispatcher = dispatcher_with_calc();
        let request = RpcMessage::Request(RequestMessage {
            call_id: 2,
            contract: "test.calc".to_string(),
            method: "fails".to_string(),
            args: vec![],
        });

        let response = dispatcher.dispatch(5, &request).unwrap();
        match &response.outcome {
            CallOutcome::Err(e) => assert_eq!(e.description, "intentional failure"),
            other => panic!("expected error outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_contract_yields_error_response() {
        let dispatcher = dispatcher_with_calc();
        let request = RpcMessage::Request(RequestMessage {
            call_id: 3,
            contract: "nope".to_string(),
            method: "nothing".to_string(),
            args: vec![],
        });

        let response = dispatcher.dispatch(5, &request).unwrap();
        assert!(matches!(response.outcome, CallOutcome::Err(_)));
    }

    #[test]
    fn test_datagram_produces_no_response() {
        let dispatcher = dispatcher_with_calc();
        let datagram = RpcMessage::Datagram(RequestMessage {
            call_id: 4,
            contract: "test.calc".to_string(),
            method: "record".to_string(),
            args: vec![],
        });

        assert!(dispatcher.dispatch(5, &datagram).is_none());
    }

    #[test]
    fn test_datagram_with_return_value_discards_it() {
        let dispatcher = dispatcher_with_calc();
        // "accepts" has a return value; invoked as a datagram the
        // caller never sees it.
        let datagram = RpcMessage::Datagram(RequestMessage {
            call_id: 5,
            contract: "test.calc".to_string(),
            method: "accepts".to_string(),
            args: encoded_args(&[("a", RpcValue::I64(0)), ("b", RpcValue::Null)]),
        });

        assert!(dispatcher.dispatch(5, &datagram).is_none());
    }

    #[test]
    fn test_response_messages_ignored() {
        let dispatcher = dispatcher_with_calc();
        let response = RpcMessage::Response(ResponseMessage {
            call_id: 9,
            outcome: CallOutcome::Ok(vec![]),
        });

        assert!(dispatcher.dispatch(5, &response).is_none());
    }
}
