pub mod config;
pub mod error;
pub mod types;

pub mod topology;
pub mod transport;
pub mod network;
pub mod http;
pub mod provider;
pub mod router;
pub mod durability;
pub mod replica;
pub mod client;

// Re-export only what's needed by external users
pub use client::Driver;
pub use config::{DriverConfig, ViewMode};
pub use durability::{DurabilityPoller, DurabilityRequest};
pub use error::{
    ConfigurationError, DurabilityError, MalformedTopologyError, NoRouteAvailable,
    ReplicaReadError, TransportError,
};
pub use provider::{ConfigurationProvider, ProviderState};
pub use router::{OperationRouter, Route};
pub use topology::{NodeRef, NodeRegistry, TopologyTable};
pub use types::{ConnectionKind, NodeState, ObserveOutcome, PersistTo, ReplicateTo};
