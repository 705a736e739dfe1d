//! Contract descriptors and the method registry.
//!
//! Instead of one generated proxy class per contract, every remotely
//! invocable method is an entry in an explicit registry keyed by
//! (contract type name, method name). Call semantics (one-way,
//! reliability, direction, timeout) are declared once per method on
//! the descriptor, not per call site.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::RpcValue;
use crate::types::SessionId;

use super::message::RemoteMethodError;

/// Which side of the session initiates the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    /// Caller opened the session
    ClientToServer,
    /// Callback over the same session, initiated by the acceptor
    ServerToClient,
}

/// Per-method call timeout declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTimeout {
    /// Use the node-wide default
    Default,
    /// Wait forever (long transfers)
    NoTimeout,
    /// Explicit bound in milliseconds
    Millis(u64),
}

impl CallTimeout {
    /// Resolve against the configured default; `None` means unbounded.
    pub fn resolve(&self, default: Duration) -> Option<Duration> {
        match self {
            CallTimeout::Default => Some(default),
            CallTimeout::NoTimeout => None,
            CallTimeout::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }
}

/// Call semantics of one contract method.
#[derive(Clone, Copy, Debug)]
pub struct MethodAttributes {
    /// Fire-and-forget: no response is awaited, return values are
    /// discarded by the caller
    pub one_way: bool,

    /// Retry transport sends until delivered or attempts exhausted
    pub reliable: bool,

    /// Initiating side
    pub direction: CallDirection,

    /// Response wait bound (ignored for one-way methods)
    pub timeout: CallTimeout,
}

impl MethodAttributes {
    /// Conventional two-way method with the default timeout.
    pub fn two_way() -> Self {
        Self {
            one_way: false,
            reliable: false,
            direction: CallDirection::ClientToServer,
            timeout: CallTimeout::Default,
        }
    }

    /// Fire-and-forget method.
    pub fn one_way() -> Self {
        Self {
            one_way: true,
            reliable: false,
            direction: CallDirection::ClientToServer,
            timeout: CallTimeout::Default,
        }
    }

    /// Mark the method reliable (session-layer send retries).
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: CallTimeout) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handler for one registered method.
///
/// Receives the decoded argument list and returns either a value or a
/// remote error description; the dispatcher owns (de)serialization.
pub type MethodHandler =
    Arc<dyn Fn(&[RpcValue]) -> Result<RpcValue, RemoteMethodError> + Send + Sync>;

/// Box a closure as a method handler.
pub fn handler<F>(f: F) -> MethodHandler
where
    F: Fn(&[RpcValue]) -> Result<RpcValue, RemoteMethodError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Declared shape of a contract: its name and method attributes.
#[derive(Clone, Debug)]
pub struct ContractDescriptor {
    /// Contract type name, the wire-visible dispatch key
    pub name: String,

    methods: HashMap<String, MethodAttributes>,
}

impl ContractDescriptor {
    /// Start a descriptor for the named contract.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Declare a method with its call attributes.
    pub fn method(mut self, name: impl Into<String>, attrs: MethodAttributes) -> Self {
        self.methods.insert(name.into(), attrs);
        self
    }

    /// Attributes of a declared method.
    pub fn attributes(&self, method: &str) -> Option<&MethodAttributes> {
        self.methods.get(method)
    }

    /// Declared method names.
    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }
}

/// A descriptor bound to its implementation handlers.
#[derive(Clone)]
pub struct ContractRegistration {
    descriptor: Arc<ContractDescriptor>,
    handlers: HashMap<String, MethodHandler>,
}

impl ContractRegistration {
    /// Bind handlers to a descriptor. Methods without a handler are
    /// dispatchable as "not implemented" errors rather than silently
    /// absent.
    pub fn new(descriptor: ContractDescriptor, handlers: HashMap<String, MethodHandler>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            handlers,
        }
    }
}

/// Registry of hosted contract implementations.
///
/// Node-wide registrations serve every session; a session-scoped
/// registration (used for callback channels) shadows the node-wide
/// one for that session only.
#[derive(Default)]
pub struct ContractRegistry {
    global: RwLock<HashMap<String, ContractRegistration>>,
    per_session: RwLock<HashMap<(SessionId, String), ContractRegistration>>,
}

impl ContractRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a contract implementation node-wide.
    pub fn register_contract(
        &self,
        descriptor: ContractDescriptor,
        handlers: HashMap<String, MethodHandler>,
    ) {
        let name = descriptor.name.clone();
        self.global
            .write()
            .insert(name, ContractRegistration::new(descriptor, handlers));
    }

    /// Host a contract implementation for one session only.
    pub fn register_for_session(
        &self,
        session: SessionId,
        descriptor: ContractDescriptor,
        handlers: HashMap<String, MethodHandler>,
    ) {
        let name = descriptor.name.clone();
        self.per_session
            .write()
            .insert((session, name), ContractRegistration::new(descriptor, handlers));
    }

    /// Whether a contract is registered node-wide.
    pub fn is_contract_registered(&self, contract: &str) -> bool {
        self.global.read().contains_key(contract)
    }

    /// Drop all session-scoped registrations for a closed session.
    pub fn forget_session(&self, session: SessionId) {
        self.per_session.write().retain(|(s, _), _| *s != session);
    }

    /// Resolve the implementation for (session, contract, method).
    pub fn resolve(
        &self,
        session: SessionId,
        contract: &str,
        method: &str,
    ) -> Option<(MethodAttributes, Option<MethodHandler>)> {
        let registration = {
            let scoped = self.per_session.read();
            scoped
                .get(&(session, contract.to_string()))
                .cloned()
                .or_else(|| self.global.read().get(contract).cloned())
        }?;

        let attrs = *registration.descriptor.attributes(method)?;
        let handler = registration.handlers.get(method).cloned();
        Some((attrs, handler))
    }

    /// Caller-side lookup of declared method attributes.
    pub fn attributes(&self, contract: &str, method: &str) -> Option<MethodAttributes> {
        self.global
            .read()
            .get(contract)
            .and_then(|r| r.descriptor.attributes(method).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_contract() -> (ContractDescriptor, HashMap<String, MethodHandler>) {
        let descriptor =
            ContractDescriptor::new("test.ping").method("ping", MethodAttributes::two_way());
        let mut handlers = HashMap::new();
        handlers.insert(
            "ping".to_string(),
            handler(|_args| Ok(RpcValue::Str("pong".to_string()))),
        );
        (descriptor, handlers)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ContractRegistry::new();
        let (descriptor, handlers) = ping_contract();
        registry.register_contract(descriptor, handlers);

        assert!(registry.is_contract_registered("test.ping"));
        assert!(!registry.is_contract_registered("test.other"));

        let (attrs, handler) = registry.resolve(1, "test.ping", "ping").unwrap();
        assert!(!attrs.one_way);
        assert!(handler.is_some());

        assert!(registry.resolve(1, "test.ping", "missing").is_none());
    }

    #[test]
    fn test_session_scoped_registration_shadows_global() {
        let registry = ContractRegistry::new();
        let (descriptor, handlers) = ping_contract();
        registry.register_contract(descriptor, handlers);

        let scoped_descriptor =
            ContractDescriptor::new("test.ping").method("ping", MethodAttributes::one_way());
        registry.register_for_session(7, scoped_descriptor, HashMap::new());

        let (attrs, _) = registry.resolve(7, "test.ping", "ping").unwrap();
        assert!(attrs.one_way);

        // Other sessions keep the global registration.
        let (attrs, _) = registry.resolve(8, "test.ping", "ping").unwrap();
        assert!(!attrs.one_way);

        registry.forget_session(7);
        let (attrs, _) = registry.resolve(7, "test.ping", "ping").unwrap();
        assert!(!attrs.one_way);
    }

    #[test]
    fn test_timeout_resolution() {
        let default = Duration::from_secs(30);

        assert_eq!(CallTimeout::Default.resolve(default), Some(default));
        assert_eq!(CallTimeout::NoTimeout.resolve(default), None);
        assert_eq!(
            CallTimeout::Millis(250).resolve(default),
            Some(Duration::from_millis(250))
        );
    }
}
