//! Partition routing table.
//!
//! A `TopologyTable` is an immutable snapshot of the cluster layout: which
//! node is primary for each partition and which nodes hold its replicas.
//! Reconfiguration never edits a table; it builds a new one and the
//! provider publishes it in a single reference swap.

use crate::error::MalformedTopologyError;
use crate::types::{ConnectionKind, NodeState};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_DIRECT_PORT: u16 = 11210;

/// A node endpoint as listed by the topology descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Position in the descriptor's server list.
    pub index: usize,
    /// `host:port` of the binary protocol.
    pub address: String,
    pub state: NodeState,
}

impl NodeRef {
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }
}

/// The set of node endpoints a table routes to, with their liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistry {
    nodes: Vec<NodeRef>,
}

impl NodeRegistry {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = addresses
            .into_iter()
            .enumerate()
            .map(|(index, address)| NodeRef {
                index,
                address: address.into(),
                state: NodeState::Active,
            })
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRef> {
        self.nodes.iter()
    }

    pub fn get(&self, index: usize) -> Option<&NodeRef> {
        self.nodes.get(index)
    }

    /// The node at `index`, but only if it is currently reachable.
    pub fn active(&self, index: usize) -> Option<&NodeRef> {
        self.nodes.get(index).filter(|node| node.is_active())
    }

    pub fn find(&self, address: &str) -> Option<&NodeRef> {
        self.nodes.iter().find(|node| node.address == address)
    }

    pub fn active_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_active()).count()
    }

    /// Copy of this registry with one node's state changed, or `None` if the
    /// address is unknown.
    pub fn with_state(&self, address: &str, state: NodeState) -> Option<Self> {
        let position = self.nodes.iter().position(|node| node.address == address)?;
        let mut nodes = self.nodes.clone();
        nodes[position].state = state;
        Some(Self { nodes })
    }
}

/// Owners of one partition, as indices into the node registry.
/// `None` is the "no node available" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub primary: Option<usize>,
    pub replicas: Vec<Option<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    rev: i64,
    #[serde(default)]
    node_locator: Option<String>,
    #[serde(default)]
    nodes: Vec<NodeEntry>,
    #[serde(default)]
    v_bucket_server_map: Option<ServerMap>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    hostname: String,
    #[serde(default)]
    ports: Ports,
}

#[derive(Debug, Default, Deserialize)]
struct Ports {
    direct: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMap {
    #[serde(default = "default_hash_algorithm")]
    hash_algorithm: String,
    #[serde(default)]
    num_replicas: usize,
    server_list: Vec<String>,
    v_bucket_map: Vec<Vec<i64>>,
}

fn default_hash_algorithm() -> String {
    "CRC".to_string()
}

/// Immutable snapshot mapping partitions to primary and replica nodes.
#[derive(Debug, Clone)]
pub struct TopologyTable {
    kind: ConnectionKind,
    name: String,
    rev: i64,
    replica_count: usize,
    partitions: Arc<[Partition]>,
    nodes: NodeRegistry,
}

impl TopologyTable {
    /// Parse a JSON topology descriptor.
    ///
    /// A `vBucketServerMap` (or `"nodeLocator": "vbucket"`) describes a
    /// partitioned bucket; anything else is a simple bucket hashed straight
    /// onto its node list.
    pub fn parse(descriptor: &str, max_replicas: usize) -> Result<Self, MalformedTopologyError> {
        let parsed: Descriptor = serde_json::from_str(descriptor)
            .map_err(|e| MalformedTopologyError::Syntax(e.to_string()))?;

        let partitioned = parsed.v_bucket_server_map.is_some()
            || parsed.node_locator.as_deref() == Some("vbucket");

        match (partitioned, parsed.v_bucket_server_map) {
            (true, Some(map)) => {
                if !map.hash_algorithm.eq_ignore_ascii_case("CRC") {
                    return Err(MalformedTopologyError::HashAlgorithm(map.hash_algorithm));
                }
                Self::partitioned(
                    parsed.name,
                    parsed.rev,
                    map.server_list,
                    map.num_replicas,
                    map.v_bucket_map,
                    max_replicas,
                )
            }
            (true, None) => Err(MalformedTopologyError::PartitionCount(0)),
            (false, _) => {
                let addresses = parsed
                    .nodes
                    .into_iter()
                    .map(|entry| {
                        let host = entry
                            .hostname
                            .rsplit_once(':')
                            .map(|(host, _)| host.to_string())
                            .unwrap_or(entry.hostname);
                        format!("{}:{}", host, entry.ports.direct.unwrap_or(DEFAULT_DIRECT_PORT))
                    })
                    .collect();
                Self::simple(parsed.name, parsed.rev, addresses)
            }
        }
    }

    /// Build a partitioned table from a server list and a partition map whose
    /// rows are `[primary, replica0, replica1, ...]` with `-1` for "no node".
    pub fn partitioned(
        name: impl Into<String>,
        rev: i64,
        servers: Vec<String>,
        replica_count: usize,
        map: Vec<Vec<i64>>,
        max_replicas: usize,
    ) -> Result<Self, MalformedTopologyError> {
        if servers.is_empty() {
            return Err(MalformedTopologyError::EmptyNodeList);
        }
        for address in &servers {
            validate_address(address)?;
        }
        if replica_count > max_replicas {
            return Err(MalformedTopologyError::ReplicaCount {
                configured: replica_count,
                max: max_replicas,
            });
        }
        if map.is_empty() || !map.len().is_power_of_two() {
            return Err(MalformedTopologyError::PartitionCount(map.len()));
        }

        let node_count = servers.len();
        let resolve = |partition: usize, index: i64| -> Result<Option<usize>, MalformedTopologyError> {
            match index {
                -1 => Ok(None),
                i if i >= 0 && (i as usize) < node_count => Ok(Some(i as usize)),
                _ => Err(MalformedTopologyError::NodeIndex {
                    partition,
                    index,
                    nodes: node_count,
                }),
            }
        };

        let mut partitions = Vec::with_capacity(map.len());
        for (partition, row) in map.into_iter().enumerate() {
            if row.is_empty() || row.len() > replica_count + 1 {
                return Err(MalformedTopologyError::PartitionWidth {
                    partition,
                    entries: row.len(),
                    expected: replica_count + 1,
                });
            }
            let primary = resolve(partition, row[0])?;
            let mut replicas = row[1..]
                .iter()
                .map(|&index| resolve(partition, index))
                .collect::<Result<Vec<_>, _>>()?;

            let mut owners: Vec<usize> = primary
                .iter()
                .chain(replicas.iter().flatten())
                .copied()
                .collect();
            owners.sort_unstable();
            if let Some(pair) = owners.windows(2).find(|pair| pair[0] == pair[1]) {
                return Err(MalformedTopologyError::DuplicateNode {
                    partition,
                    index: pair[0],
                });
            }

            replicas.resize(replica_count, None);
            partitions.push(Partition { primary, replicas });
        }

        Ok(Self {
            kind: ConnectionKind::Partitioned,
            name: name.into(),
            rev,
            replica_count,
            partitions: partitions.into(),
            nodes: NodeRegistry::new(servers),
        })
    }

    /// Build a simple table: one partition per node, no replicas.
    pub fn simple(
        name: impl Into<String>,
        rev: i64,
        servers: Vec<String>,
    ) -> Result<Self, MalformedTopologyError> {
        if servers.is_empty() {
            return Err(MalformedTopologyError::EmptyNodeList);
        }
        for address in &servers {
            validate_address(address)?;
        }
        let partitions: Vec<Partition> = (0..servers.len())
            .map(|index| Partition {
                primary: Some(index),
                replicas: Vec::new(),
            })
            .collect();

        Ok(Self {
            kind: ConnectionKind::Simple,
            name: name.into(),
            rev,
            replica_count: 0,
            partitions: partitions.into(),
            nodes: NodeRegistry::new(servers),
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rev(&self) -> i64 {
        self.rev
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Hash a key into `[0, partition_count)`.
    pub fn partition_of(&self, key: &str) -> u32 {
        let hash = (crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff;
        hash % self.partitions.len() as u32
    }

    pub fn partition(&self, partition: u32) -> Option<&Partition> {
        self.partitions.get(partition as usize)
    }

    /// The reachable primary of a partition.
    pub fn primary_node(&self, partition: u32) -> Option<&NodeRef> {
        self.partition(partition)?
            .primary
            .and_then(|index| self.nodes.active(index))
    }

    /// The reachable replica at `replica_index` of a partition.
    pub fn replica_node(&self, partition: u32, replica_index: usize) -> Option<&NodeRef> {
        self.partition(partition)?
            .replicas
            .get(replica_index)
            .copied()
            .flatten()
            .and_then(|index| self.nodes.active(index))
    }

    /// Replicas of a partition in replica order; index 0 is the first replica.
    /// Unassigned or unreachable slots are `None`.
    pub fn replica_nodes(&self, partition: u32) -> Vec<Option<&NodeRef>> {
        (0..self.replica_count)
            .map(|replica_index| self.replica_node(partition, replica_index))
            .collect()
    }

    /// Replicas configured cluster-wide.
    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Replicas that can actually be reached: bounded by the live node count.
    pub fn available_replicas(&self) -> usize {
        self.nodes
            .active_count()
            .saturating_sub(1)
            .min(self.replica_count)
    }

    /// New table sharing this partition layout with one node's state changed.
    pub fn with_node_state(&self, address: &str, state: NodeState) -> Option<Self> {
        let nodes = self.nodes.with_state(address, state)?;
        Some(Self {
            kind: self.kind,
            name: self.name.clone(),
            rev: self.rev,
            replica_count: self.replica_count,
            partitions: Arc::clone(&self.partitions),
            nodes,
        })
    }
}

fn validate_address(address: &str) -> Result<(), MalformedTopologyError> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(MalformedTopologyError::Address(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_descriptor() -> String {
        r#"{
            "name": "default",
            "rev": 7,
            "nodeLocator": "vbucket",
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, -1]]
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_partitioned() {
        let table = TopologyTable::parse(&two_node_descriptor(), 3).unwrap();

        assert_eq!(table.kind(), ConnectionKind::Partitioned);
        assert_eq!(table.rev(), 7);
        assert_eq!(table.partition_count(), 4);
        assert_eq!(table.replica_count(), 1);
        assert_eq!(table.primary_node(1).unwrap().address, "10.0.0.2:11210");
        assert_eq!(table.replica_node(0, 0).unwrap().address, "10.0.0.2:11210");
        assert_eq!(table.replica_nodes(2), vec![None]);
    }

    #[test]
    fn test_parse_simple() {
        let descriptor = r#"{
            "name": "cache",
            "nodeLocator": "ketama",
            "nodes": [
                {"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}},
                {"hostname": "10.0.0.2:8091"}
            ]
        }"#;
        let table = TopologyTable::parse(descriptor, 3).unwrap();

        assert_eq!(table.kind(), ConnectionKind::Simple);
        assert_eq!(table.partition_count(), 2);
        assert_eq!(table.replica_count(), 0);
        assert_eq!(table.nodes().get(1).unwrap().address, "10.0.0.2:11210");
        assert!(table.replica_nodes(0).is_empty());
    }

    #[test]
    fn test_partition_of_is_stable_and_in_range() {
        let table = TopologyTable::parse(&two_node_descriptor(), 3).unwrap();
        for i in 0..500 {
            let key = format!("key-{}", i);
            let partition = table.partition_of(&key);
            assert!((partition as usize) < table.partition_count());
            assert_eq!(partition, table.partition_of(&key));
        }
    }

    #[test]
    fn test_partition_of_uses_upper_crc_bits() {
        let table = TopologyTable::partitioned(
            "default",
            1,
            vec!["10.0.0.1:11210".to_string()],
            0,
            vec![vec![0]; 1024],
            3,
        )
        .unwrap();
        let expected = ((crc32fast::hash(b"foo") >> 16) & 0x7fff) % 1024;
        assert_eq!(table.partition_of("foo"), expected);
    }

    #[test]
    fn test_malformed_descriptors() {
        let servers = vec!["10.0.0.1:11210".to_string()];
        let two = vec!["10.0.0.1:11210".to_string(), "10.0.0.2:11210".to_string()];

        assert!(matches!(
            TopologyTable::partitioned("d", 1, servers.clone(), 0, vec![vec![0]; 3], 3),
            Err(MalformedTopologyError::PartitionCount(3))
        ));
        assert!(matches!(
            TopologyTable::partitioned("d", 1, servers.clone(), 0, vec![vec![0], vec![4]], 3),
            Err(MalformedTopologyError::NodeIndex { partition: 1, index: 4, .. })
        ));
        assert!(matches!(
            TopologyTable::partitioned("d", 1, servers.clone(), 0, vec![vec![0, 0]; 2], 3),
            Err(MalformedTopologyError::PartitionWidth { .. })
        ));
        assert!(matches!(
            TopologyTable::partitioned("d", 1, servers.clone(), 4, vec![vec![0]; 2], 3),
            Err(MalformedTopologyError::ReplicaCount { configured: 4, max: 3 })
        ));
        assert!(matches!(
            TopologyTable::partitioned("d", 1, two.clone(), 1, vec![vec![0, 1], vec![1, 1]], 3),
            Err(MalformedTopologyError::DuplicateNode { partition: 1, index: 1 })
        ));
        assert!(TopologyTable::partitioned("d", 1, two, 2, vec![vec![0, -1, -1]; 2], 3).is_ok());
        assert!(matches!(
            TopologyTable::partitioned("d", 1, Vec::new(), 0, vec![vec![0]; 2], 3),
            Err(MalformedTopologyError::EmptyNodeList)
        ));
        assert!(matches!(
            TopologyTable::parse("{ not json", 3),
            Err(MalformedTopologyError::Syntax(_))
        ));
    }

    #[test]
    fn test_inactive_node_resolves_to_sentinel() {
        let table = TopologyTable::parse(&two_node_descriptor(), 3).unwrap();
        let degraded = table
            .with_node_state("10.0.0.2:11210", NodeState::Inactive)
            .unwrap();

        assert!(degraded.primary_node(1).is_none());
        assert!(degraded.replica_node(0, 0).is_none());
        assert_eq!(degraded.available_replicas(), 0);
        // the original snapshot is untouched
        assert!(table.primary_node(1).is_some());
        assert_eq!(table.available_replicas(), 1);
        assert!(table.with_node_state("10.9.9.9:11210", NodeState::Inactive).is_none());
    }
}
