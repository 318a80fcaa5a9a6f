//! Replica read coordination.
//!
//! A replica read races one get against the primary and one replica get per
//! configured replica. The first successful reply wins and the remaining
//! reads are aborted without waiting for them. Dropping the read aborts
//! whatever is still running.

use crate::error::{NoRouteAvailable, ReplicaReadError, TransportResult};
use crate::router::OperationRouter;
use crate::topology::NodeRef;
use crate::transport::NodeClient;
use crate::types::{GetReply, GetStatus};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Which copy a read went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    Primary,
    Replica(u32),
}

pub struct ReplicaReadCoordinator {
    router: OperationRouter,
    client: Arc<dyn NodeClient>,
    timeout: Duration,
}

impl ReplicaReadCoordinator {
    pub fn new(router: OperationRouter, client: Arc<dyn NodeClient>, timeout: Duration) -> Self {
        Self {
            router,
            client,
            timeout,
        }
    }

    /// Read `key` from whichever of the primary and its replicas answers
    /// successfully first.
    pub async fn get_from_replica(&self, key: &str) -> Result<GetReply, ReplicaReadError> {
        let topology = self
            .router
            .provider()
            .current_topology()
            .ok_or_else(|| NoRouteAvailable {
                key: key.to_string(),
                partition: None,
            })?;

        let partition = topology.partition_of(key);
        // the replica count is read once per attempt
        let replica_count = topology.replica_count();

        let mut targets: Vec<(ReadTarget, Option<NodeRef>)> = (0..replica_count)
            .map(|index| {
                (
                    ReadTarget::Replica(index as u32),
                    topology.replica_node(partition, index).cloned(),
                )
            })
            .collect();
        targets.push((ReadTarget::Primary, topology.primary_node(partition).cloned()));

        let mut reads = FuturesUnordered::new();
        let mut aborts = AbortOnDrop::default();
        let mut discarded = 0;

        for (target, node) in targets {
            let Some(node) = node else {
                discarded += 1;
                tracing::debug!(key = %key, target = ?target, "silently discarding read, no node available");
                continue;
            };

            let client = Arc::clone(&self.client);
            let key = key.to_string();
            let handle = tokio::spawn(async move {
                let reply = read_one(client.as_ref(), &node, &key, partition, target).await;
                (target, reply)
            });
            aborts.0.push(handle.abort_handle());
            reads.push(handle);
        }

        if discarded == replica_count + 1 {
            return Err(ReplicaReadError::NoReplicaAvailable {
                key: key.to_string(),
            });
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut failed = 0;
        let mut stale_topology = false;

        loop {
            let next = match tokio::time::timeout_at(deadline, reads.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(ReplicaReadError::Timeout {
                        key: key.to_string(),
                        elapsed: self.timeout,
                    });
                }
            };

            match next {
                Some(Ok((target, Ok(reply)))) if reply.is_success() => {
                    tracing::debug!(key = %key, target = ?target, node = %reply.node, "replica read won");
                    if stale_topology {
                        self.router.provider().signal_outdated();
                    }
                    return Ok(reply);
                }
                Some(Ok((target, Ok(reply)))) => {
                    if reply.status == GetStatus::NotMyPartition {
                        stale_topology = true;
                    }
                    tracing::debug!(key = %key, target = ?target, status = ?reply.status, "read did not succeed");
                    failed += 1;
                }
                Some(Ok((target, Err(e)))) => {
                    tracing::debug!(key = %key, target = ?target, error = %e, "read failed");
                    failed += 1;
                }
                Some(Err(e)) => {
                    tracing::debug!(key = %key, error = %e, "read task did not complete");
                    failed += 1;
                }
                None => break,
            }
        }

        if stale_topology {
            self.router.provider().signal_outdated();
        }
        Err(ReplicaReadError::AllFailed {
            key: key.to_string(),
            failed,
        })
    }
}

async fn read_one(
    client: &dyn NodeClient,
    node: &NodeRef,
    key: &str,
    partition: u32,
    target: ReadTarget,
) -> TransportResult<GetReply> {
    match target {
        ReadTarget::Primary => client.get(node, key, partition).await,
        ReadTarget::Replica(index) => client.replica_get(node, key, partition, index).await,
    }
}

/// Aborts the tracked tasks when dropped, on every exit path including the
/// caller dropping the read.
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}
