//! Node composition: configuration, events and the running peer.

pub mod config;
pub mod events;
pub mod node;

pub use config::NodeConfig;
pub use events::{EventBus, MeshEvent, SubscriptionId};
pub use node::{MeshNode, NodeState, NodeStats, CONTROL_CONTRACT};
