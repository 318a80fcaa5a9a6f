//! Operation routing.
//!
//! Every routing decision reads the provider's current table; nothing is
//! cached beyond a single `Route`.

use crate::error::NoRouteAvailable;
use crate::provider::ConfigurationProvider;
use crate::topology::{NodeRef, TopologyTable};
use std::sync::Arc;

/// Where one operation on one key should go.
#[derive(Debug, Clone)]
pub struct Route {
    pub partition: u32,
    pub primary: NodeRef,
    /// Replicas in replica order; `None` marks a slot with no reachable node.
    pub replicas: Vec<Option<NodeRef>>,
    /// The table this decision was made against.
    pub topology: Arc<TopologyTable>,
}

impl Route {
    /// Primary followed by every reachable replica.
    pub fn observe_targets(&self) -> Vec<&NodeRef> {
        std::iter::once(&self.primary)
            .chain(self.replicas.iter().flatten())
            .collect()
    }
}

#[derive(Clone)]
pub struct OperationRouter {
    provider: Arc<ConfigurationProvider>,
}

impl OperationRouter {
    pub fn new(provider: Arc<ConfigurationProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<ConfigurationProvider> {
        &self.provider
    }

    /// Route `key` against the freshest published table.
    pub fn route(&self, key: &str) -> Result<Route, NoRouteAvailable> {
        let topology = self.provider.current_topology().ok_or_else(|| NoRouteAvailable {
            key: key.to_string(),
            partition: None,
        })?;
        route_with(topology, key)
    }
}

/// Route `key` against a specific table.
pub fn route_with(topology: Arc<TopologyTable>, key: &str) -> Result<Route, NoRouteAvailable> {
    let partition = topology.partition_of(key);

    let primary = topology
        .primary_node(partition)
        .cloned()
        .ok_or_else(|| NoRouteAvailable {
            key: key.to_string(),
            partition: Some(partition),
        })?;

    let replicas = topology
        .replica_nodes(partition)
        .into_iter()
        .map(|node| node.cloned())
        .collect();

    Ok(Route {
        partition,
        primary,
        replicas,
        topology,
    })
}
