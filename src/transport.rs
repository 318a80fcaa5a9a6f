//! Seams to the wire.
//!
//! The core never speaks a protocol directly; it asks a `ConfigTransport`
//! for descriptor text and a `NodeClient` to run one request against one
//! node. `network` and `http` provide the real implementations.

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::topology::NodeRef;
use crate::types::{GetReply, ObserveReply, TransportKind};

/// A descriptor as returned by one responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    /// Host of the node that answered, used to expand `$HOST`.
    pub origin: String,
    pub text: String,
}

/// One channel able to fetch topology descriptors from the seed nodes.
#[async_trait]
pub trait ConfigTransport: Send + Sync {
    /// Decides how descriptors from this transport are post-processed.
    fn kind(&self) -> TransportKind;

    /// Fetch descriptors, usually one: the first usable answer.
    async fn fetch(&self) -> TransportResult<Vec<RawDescriptor>>;
}

/// Runs single requests against a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn observe(
        &self,
        node: &NodeRef,
        key: &str,
        cas: u64,
        partition: u32,
    ) -> TransportResult<ObserveReply>;

    async fn get(&self, node: &NodeRef, key: &str, partition: u32) -> TransportResult<GetReply>;

    async fn replica_get(
        &self,
        node: &NodeRef,
        key: &str,
        partition: u32,
        replica_index: u32,
    ) -> TransportResult<GetReply>;
}
