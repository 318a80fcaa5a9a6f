use rkyv;
use serde;
use uuid::Uuid;

/// Liveness of a node as known to the driver.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub enum NodeState {
    Active,
    Inactive,
    Suspected,
}

/// How keys map to nodes for the connected bucket. Chosen once when the
/// driver connects.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Keys hash into a fixed set of partitions with primaries and replicas.
    Partitioned,
    /// Keys hash directly onto the node list; no replicas.
    Simple,
}

/// Which channel produced a topology descriptor.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Binary,
    Http,
}

impl TransportKind {
    pub fn other(self) -> Self {
        match self {
            TransportKind::Binary => TransportKind::Http,
            TransportKind::Http => TransportKind::Binary,
        }
    }
}

/// Number of nodes that must have persisted a mutation to disk, master first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PersistTo {
    #[default]
    Zero,
    Master,
    Two,
    Three,
    Four,
}

impl PersistTo {
    pub fn value(self) -> usize {
        match self {
            PersistTo::Zero => 0,
            PersistTo::Master => 1,
            PersistTo::Two => 2,
            PersistTo::Three => 3,
            PersistTo::Four => 4,
        }
    }

    /// Replicas (excluding the master) that must report the key persisted.
    pub fn replicas(self) -> usize {
        self.value().saturating_sub(1)
    }
}

/// Number of replicas a mutation must have reached, persisted or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReplicateTo {
    #[default]
    Zero,
    One,
    Two,
    Three,
}

impl ReplicateTo {
    pub fn value(self) -> usize {
        match self {
            ReplicateTo::Zero => 0,
            ReplicateTo::One => 1,
            ReplicateTo::Two => 2,
            ReplicateTo::Three => 3,
        }
    }
}

/// Per-node, per-round classification of an observe reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveOutcome {
    FoundNotPersisted,
    FoundPersisted,
    NotFoundNotPersisted,
    NotFoundPersisted,
    /// The node holds a different revision than the one being confirmed.
    Modified,
    /// The node did not answer within the round.
    Error,
}

/// Key state as reported by a node, before version-token comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub enum KeyState {
    FoundNotPersisted,
    FoundPersisted,
    NotFoundNotPersisted,
    NotFoundPersisted,
}

impl ObserveOutcome {
    /// Classify a reply against the version token the caller expects.
    ///
    /// A cas mismatch means the key was modified, except for a persisted
    /// miss: the key is gone and its cas no longer matters.
    pub fn classify(expected_cas: u64, seen_cas: u64, state: KeyState) -> Self {
        if seen_cas != expected_cas && state != KeyState::NotFoundPersisted {
            return ObserveOutcome::Modified;
        }
        match state {
            KeyState::FoundNotPersisted => ObserveOutcome::FoundNotPersisted,
            KeyState::FoundPersisted => ObserveOutcome::FoundPersisted,
            KeyState::NotFoundNotPersisted => ObserveOutcome::NotFoundNotPersisted,
            KeyState::NotFoundPersisted => ObserveOutcome::NotFoundPersisted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub enum GetStatus {
    Success,
    NotFound,
    /// The node no longer owns the partition; the topology is stale.
    NotMyPartition,
    Failure,
}

/// Messages exchanged with a node over the binary protocol.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub enum NodeMessage {
    GetConfig,
    Config {
        descriptor: Option<String>,
    },

    Observe {
        key: String,
        cas: u64,
        partition: u32,
    },
    ObserveResponse {
        key: String,
        cas: u64,
        state: KeyState,
    },

    Get {
        key: String,
        partition: u32,
    },
    ReplicaGet {
        key: String,
        partition: u32,
        replica_index: u32,
    },
    GetResponse {
        status: GetStatus,
        cas: u64,
        value: Option<Vec<u8>>,
    },
}

/// A framed request or response; replies echo the request id.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub struct Envelope {
    pub id: RequestId,
    pub message: NodeMessage,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub struct RequestId(pub Uuid);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

/// What a node said about a key in reply to an observe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveReply {
    pub node: String,
    pub cas: u64,
    pub state: KeyState,
}

/// Reply to a get or replica get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetReply {
    pub node: String,
    pub status: GetStatus,
    pub cas: u64,
    pub value: Option<Vec<u8>>,
}

impl GetReply {
    pub fn is_success(&self) -> bool {
        self.status == GetStatus::Success
    }
}
