//! Meshwork Core Library
//!
//! A self-healing virtual network overlay:
//! - Versioned peer-record gossip with anti-entropy full sync
//! - Reachability routing with black-hole exclusion
//! - Session multiplexing over framed TCP
//! - Contract-based RPC with tagged call outcomes
//! - NAT gateway registration

pub mod codec;
pub mod nat;
pub mod node;
pub mod rpc;
pub mod session;
pub mod topology;
pub mod types;

// Re-export core types for convenience
pub use node::{MeshNode, NodeConfig};
pub use rpc::{CallError, ContractDescriptor, ContractRegistry, RpcClient};
pub use session::{SessionManager, WireMessage};
pub use topology::{GossipPropagator, PeerRecord, PeerRecordStore, ReachabilityGraph};
pub use types::{AddressEndPoint, PeerId, SessionId, StateId};
