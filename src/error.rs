//! Error types for the driver core.
//!
//! Each public surface gets its own enum so callers can match on exactly the
//! failures that surface can produce.

use std::time::Duration;
use thiserror::Error;

use crate::types::{PersistTo, ReplicateTo};

/// Failure talking to a single node or seed over one of the transports.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no seed node answered")]
    NoResponse,
}

/// A descriptor parsed but does not describe a consistent topology.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedTopologyError {
    #[error("descriptor is not valid JSON: {0}")]
    Syntax(String),

    #[error("partition count {0} is not a non-zero power of two")]
    PartitionCount(usize),

    #[error("descriptor lists no nodes")]
    EmptyNodeList,

    #[error("unsupported hash algorithm {0:?}")]
    HashAlgorithm(String),

    #[error("replica count {configured} exceeds the maximum of {max}")]
    ReplicaCount { configured: usize, max: usize },

    #[error("partition {partition} has {entries} entries, expected at most {expected}")]
    PartitionWidth {
        partition: usize,
        entries: usize,
        expected: usize,
    },

    #[error("partition {partition} references node {index} but only {nodes} nodes exist")]
    NodeIndex {
        partition: usize,
        index: i64,
        nodes: usize,
    },

    #[error("partition {partition} lists node {index} more than once")]
    DuplicateNode { partition: usize, index: usize },

    #[error("node address {0:?} is not host:port")]
    Address(String),
}

/// Failure acquiring or refreshing the cluster topology.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// Neither transport produced a usable descriptor.
    #[error("no valid configuration: {}", .failures.join("; "))]
    NoValidConfiguration { failures: Vec<String> },

    #[error(transparent)]
    Malformed(#[from] MalformedTopologyError),

    #[error("stale descriptor: revision {offered} is older than published revision {current}")]
    StaleRevision { offered: i64, current: i64 },
}

/// Routing found no primary node for a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route available for key {key:?} (partition {partition:?})")]
pub struct NoRouteAvailable {
    pub key: String,
    /// `None` when no topology has been published yet.
    pub partition: Option<u32>,
}

/// Failure confirming that a mutation reached the requested durability.
#[derive(Debug, Clone, Error)]
pub enum DurabilityError {
    #[error(
        "key {key:?}: requested persist_to={persist_to:?} replicate_to={replicate_to:?} \
         but only {available} replica(s) are available"
    )]
    InsufficientReplicas {
        key: String,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        available: usize,
    },

    #[error("key {key:?} was modified (expected cas {cas}) after {rounds} observe round(s)")]
    ModifiedConflict { key: String, cas: u64, rounds: u32 },

    #[error(
        "key {key:?}: observe timed out after {attempts} round(s) in {elapsed:?} \
         (persist_to={persist_to:?} replicate_to={replicate_to:?})"
    )]
    ObserveTimeout {
        key: String,
        persist_to: PersistTo,
        replicate_to: ReplicateTo,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("key {key:?}: observe interrupted after {rounds} round(s)")]
    ObserveInterrupted { key: String, rounds: u32 },

    #[error(transparent)]
    NoRoute(#[from] NoRouteAvailable),
}

/// Failure reading a key from the primary or any replica.
#[derive(Debug, Clone, Error)]
pub enum ReplicaReadError {
    /// Every read was discarded before dispatch.
    #[error("no replica get for key {key:?} could be dispatched")]
    NoReplicaAvailable { key: String },

    #[error("key {key:?}: no read succeeded ({failed} failed)")]
    AllFailed { key: String, failed: usize },

    #[error("key {key:?}: replica read timed out after {elapsed:?}")]
    Timeout { key: String, elapsed: Duration },

    #[error(transparent)]
    NoRoute(#[from] NoRouteAvailable),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
