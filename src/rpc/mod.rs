//! Remote invocation over sessions.
//!
//! Contracts are declared as descriptors and hosted through an
//! explicit registry instead of generated proxy types. Requests,
//! responses and fire-and-forget datagrams all ride the session
//! layer's wire messages; failures are values, never panics.

pub mod contract;
pub mod dispatch;
pub mod message;
pub mod proxy;

pub use contract::{
    handler, CallDirection, CallTimeout, ContractDescriptor, ContractRegistry, MethodAttributes,
    MethodHandler,
};
pub use dispatch::RpcDispatcher;
pub use message::{
    Argument, CallOutcome, RemoteMethodError, RequestMessage, ResponseMessage, RpcMessage,
};
pub use proxy::{CallError, RpcClient};
