//! Durability confirmation by observe polling.
//!
//! After a mutation is acknowledged by its primary, the caller may demand
//! that it is also persisted and/or replicated. The poller broadcasts an
//! observe to the primary and every replica of the key each round, counts
//! what that round reports, and stops when the requirement is met, when the
//! key turns out to have been modified, or when the round budget runs out.
//!
//! Counting rule, per round and from that round's replies only:
//! - mutation: a replica reporting the key found counts as replicated; found
//!   and persisted also counts as replica-persisted. The primary reporting
//!   found and persisted sets `master_persisted`.
//! - delete: the same with "not found" in place of "found".
//!
//! The round succeeds when `replicated >= replicate_to`,
//! `replica_persisted >= persist_to - 1` and, if `persist_to > 0`,
//! `master_persisted`.

use crate::config::DriverConfig;
use crate::error::{DurabilityError, NoRouteAvailable};
use crate::router::{OperationRouter, Route};
use crate::transport::NodeClient;
use crate::types::{ConnectionKind, ObserveOutcome, PersistTo, ReplicateTo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A mutation whose durability is to be confirmed.
#[derive(Debug, Clone)]
pub struct DurabilityRequest {
    pub key: String,
    /// Version token returned by the mutation.
    pub cas: u64,
    pub persist_to: PersistTo,
    pub replicate_to: ReplicateTo,
    pub is_delete: bool,
}

impl DurabilityRequest {
    pub fn new(key: impl Into<String>, cas: u64) -> Self {
        Self {
            key: key.into(),
            cas,
            persist_to: PersistTo::Zero,
            replicate_to: ReplicateTo::Zero,
            is_delete: false,
        }
    }

    pub fn persist_to(mut self, persist_to: PersistTo) -> Self {
        self.persist_to = persist_to;
        self
    }

    pub fn replicate_to(mut self, replicate_to: ReplicateTo) -> Self {
        self.replicate_to = replicate_to;
        self
    }

    pub fn delete(mut self) -> Self {
        self.is_delete = true;
        self
    }

    /// Nothing to wait for: the primary's acknowledgement is enough.
    pub fn is_trivial(&self) -> bool {
        self.persist_to == PersistTo::Zero && self.replicate_to == ReplicateTo::Zero
    }

    /// Replicas this request needs, counting both persistence and replication.
    fn replicas_needed(&self) -> usize {
        self.replicate_to.value().max(self.persist_to.replicas())
    }

    /// Fail if the route cannot possibly satisfy the request.
    fn check_satisfiable(&self, route: &Route) -> Result<(), DurabilityError> {
        let topology = &route.topology;
        let available = match topology.kind() {
            ConnectionKind::Simple => 0,
            ConnectionKind::Partitioned => {
                let reachable = route.replicas.iter().flatten().count();
                reachable.min(topology.available_replicas())
            }
        };

        let persistence_unsupported =
            topology.kind() == ConnectionKind::Simple && self.persist_to != PersistTo::Zero;

        if persistence_unsupported || self.replicas_needed() > available {
            return Err(DurabilityError::InsufficientReplicas {
                key: self.key.clone(),
                persist_to: self.persist_to,
                replicate_to: self.replicate_to,
                available,
            });
        }
        Ok(())
    }
}

/// Counters for one observe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundTally {
    pub replicated: usize,
    pub replica_persisted: usize,
    pub master_persisted: bool,
    pub master_modified: bool,
}

impl RoundTally {
    /// Tally one round of `(is_master, outcome)` replies.
    pub fn from_outcomes<'a, I>(outcomes: I, is_delete: bool) -> Self
    where
        I: IntoIterator<Item = &'a (bool, ObserveOutcome)>,
    {
        let (present, persisted) = if is_delete {
            (
                ObserveOutcome::NotFoundNotPersisted,
                ObserveOutcome::NotFoundPersisted,
            )
        } else {
            (
                ObserveOutcome::FoundNotPersisted,
                ObserveOutcome::FoundPersisted,
            )
        };

        let mut tally = RoundTally::default();
        for &(is_master, outcome) in outcomes {
            if is_master {
                match outcome {
                    ObserveOutcome::Modified => tally.master_modified = true,
                    o if o == persisted => tally.master_persisted = true,
                    _ => {}
                }
            } else if outcome == present {
                tally.replicated += 1;
            } else if outcome == persisted {
                tally.replicated += 1;
                tally.replica_persisted += 1;
            }
        }
        tally
    }

    pub fn satisfies(&self, persist_to: PersistTo, replicate_to: ReplicateTo) -> bool {
        self.replicated >= replicate_to.value()
            && self.replica_persisted >= persist_to.replicas()
            && (persist_to == PersistTo::Zero || self.master_persisted)
    }
}

/// Polling budget.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
    /// How long a round waits for replies before counting the rest as errors.
    pub round_timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            interval: config.obs_poll_interval,
            max_attempts: config.obs_poll_max,
            round_timeout: config.operation_timeout,
        }
    }

    /// Rounds allowed for a caller-supplied overall budget.
    fn attempts_within(&self, timeout: Option<Duration>) -> u32 {
        let Some(timeout) = timeout else {
            return self.max_attempts;
        };
        let interval = self.interval.as_nanos().max(1);
        let rounds = timeout.as_nanos().div_ceil(interval);
        (rounds.min(u128::from(self.max_attempts)) as u32).max(1)
    }
}

pub struct DurabilityPoller {
    router: OperationRouter,
    client: Arc<dyn NodeClient>,
    settings: PollSettings,
}

impl DurabilityPoller {
    pub fn new(router: OperationRouter, client: Arc<dyn NodeClient>, settings: PollSettings) -> Self {
        Self {
            router,
            client,
            settings,
        }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// One observe broadcast for `key`, keyed by node address.
    pub async fn observe(
        &self,
        key: &str,
        cas: u64,
    ) -> Result<HashMap<String, ObserveOutcome>, NoRouteAvailable> {
        let route = self.router.route(key)?;
        let deadline = Instant::now() + self.settings.round_timeout;
        Ok(self
            .observe_round(&route, key, cas, deadline)
            .await
            .into_iter()
            .map(|(address, _, outcome)| (address, outcome))
            .collect())
    }

    /// Broadcast one observe to the route's primary and replicas in parallel.
    /// Nodes that fail or miss `deadline` report `Error`.
    async fn observe_round(
        &self,
        route: &Route,
        key: &str,
        cas: u64,
        deadline: Instant,
    ) -> Vec<(String, bool, ObserveOutcome)> {
        // observe_targets lists the primary first
        let requests = route.observe_targets().into_iter().enumerate().map(|(position, node)| {
            let client = Arc::clone(&self.client);
            let is_master = position == 0;
            async move {
                let reply = tokio::time::timeout_at(
                    deadline,
                    client.observe(node, key, cas, route.partition),
                )
                .await;

                let outcome = match reply {
                    Ok(Ok(reply)) => ObserveOutcome::classify(cas, reply.cas, reply.state),
                    Ok(Err(e)) => {
                        tracing::debug!(node = %node.address, error = %e, "observe failed");
                        ObserveOutcome::Error
                    }
                    Err(_) => {
                        tracing::debug!(node = %node.address, "observe missed round deadline");
                        ObserveOutcome::Error
                    }
                };
                (node.address.clone(), is_master, outcome)
            }
        });

        futures::future::join_all(requests).await
    }

    /// Wait until `request` is durable. `timeout` bounds the whole wait,
    /// rounds and sleeps included; `None` leaves only the round budget.
    pub async fn confirm_durability(
        &self,
        request: &DurabilityRequest,
        timeout: Option<Duration>,
    ) -> Result<(), DurabilityError> {
        // nobody holds the sender, so this never fires
        let (_, cancel) = watch::channel(false);
        self.poll(request, timeout, cancel).await
    }

    /// Like `confirm_durability`, but stops with `ObserveInterrupted` as soon
    /// as `cancel` turns true.
    pub async fn confirm_durability_cancellable(
        &self,
        request: &DurabilityRequest,
        timeout: Option<Duration>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), DurabilityError> {
        self.poll(request, timeout, cancel).await
    }

    async fn poll(
        &self,
        request: &DurabilityRequest,
        timeout: Option<Duration>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), DurabilityError> {
        if request.is_trivial() {
            return Ok(());
        }

        let max_attempts = self.settings.attempts_within(timeout);
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);
        let timed_out = |attempts: u32| DurabilityError::ObserveTimeout {
            key: request.key.clone(),
            persist_to: request.persist_to,
            replicate_to: request.replicate_to,
            attempts,
            elapsed: started.elapsed(),
        };

        for attempt in 1..=max_attempts {
            if *cancel.borrow() {
                return Err(DurabilityError::ObserveInterrupted {
                    key: request.key.clone(),
                    rounds: attempt - 1,
                });
            }

            // Re-route every round: the topology may have changed underneath us.
            let route = self.router.route(&request.key)?;
            request.check_satisfiable(&route)?;

            let round_deadline = cap(Instant::now() + self.settings.round_timeout, deadline);
            let replies = self
                .observe_round(&route, &request.key, request.cas, round_deadline)
                .await;
            let outcomes: Vec<(bool, ObserveOutcome)> = replies
                .iter()
                .map(|(_, is_master, outcome)| (*is_master, *outcome))
                .collect();
            let tally = RoundTally::from_outcomes(&outcomes, request.is_delete);

            tracing::debug!(
                key = %request.key,
                attempt,
                replicated = tally.replicated,
                replica_persisted = tally.replica_persisted,
                master_persisted = tally.master_persisted,
                "observe round"
            );

            if tally.master_modified {
                return Err(DurabilityError::ModifiedConflict {
                    key: request.key.clone(),
                    cas: request.cas,
                    rounds: attempt,
                });
            }
            if tally.satisfies(request.persist_to, request.replicate_to) {
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(timed_out(attempt));
            }

            let wake = cap(Instant::now() + self.settings.interval, deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancelled(&mut cancel) => {
                    tracing::debug!(key = %request.key, attempt, "observe interrupted");
                    return Err(DurabilityError::ObserveInterrupted {
                        key: request.key.clone(),
                        rounds: attempt,
                    });
                }
            }
        }

        Err(timed_out(max_attempts))
    }
}

fn cap(at: Instant, deadline: Option<Instant>) -> Instant {
    deadline.map_or(at, |deadline| deadline.min(at))
}

/// Resolves once `cancel` reads true; never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_mutation() {
        let outcomes = [
            (true, ObserveOutcome::FoundPersisted),
            (false, ObserveOutcome::FoundNotPersisted),
            (false, ObserveOutcome::FoundPersisted),
            (false, ObserveOutcome::Error),
        ];
        let tally = RoundTally::from_outcomes(&outcomes, false);

        assert_eq!(tally.replicated, 2);
        assert_eq!(tally.replica_persisted, 1);
        assert!(tally.master_persisted);
        assert!(tally.satisfies(PersistTo::Two, ReplicateTo::Two));
        assert!(!tally.satisfies(PersistTo::Three, ReplicateTo::Zero));
    }

    #[test]
    fn test_tally_delete() {
        let outcomes = [
            (true, ObserveOutcome::NotFoundPersisted),
            (false, ObserveOutcome::NotFoundNotPersisted),
            (false, ObserveOutcome::FoundPersisted),
        ];
        let tally = RoundTally::from_outcomes(&outcomes, true);

        assert_eq!(tally.replicated, 1);
        assert_eq!(tally.replica_persisted, 0);
        assert!(tally.master_persisted);
        assert!(tally.satisfies(PersistTo::Master, ReplicateTo::One));
        assert!(!tally.satisfies(PersistTo::Two, ReplicateTo::Zero));
    }

    #[test]
    fn test_master_not_persisted_blocks_persist_to_master() {
        let outcomes = [(true, ObserveOutcome::FoundNotPersisted)];
        let tally = RoundTally::from_outcomes(&outcomes, false);

        assert!(!tally.satisfies(PersistTo::Master, ReplicateTo::Zero));
        assert!(tally.satisfies(PersistTo::Zero, ReplicateTo::Zero));
    }

    #[test]
    fn test_modified_only_counts_on_master() {
        let replica_modified = [(false, ObserveOutcome::Modified)];
        assert!(!RoundTally::from_outcomes(&replica_modified, false).master_modified);

        let master_modified = [(true, ObserveOutcome::Modified)];
        assert!(RoundTally::from_outcomes(&master_modified, false).master_modified);
    }

    #[test]
    fn test_attempts_within_timeout() {
        let settings = PollSettings {
            interval: Duration::from_millis(10),
            max_attempts: 500,
            round_timeout: Duration::from_millis(100),
        };

        assert_eq!(settings.attempts_within(None), 500);
        assert_eq!(settings.attempts_within(Some(Duration::from_millis(95))), 10);
        assert_eq!(settings.attempts_within(Some(Duration::from_secs(60))), 500);
        assert_eq!(settings.attempts_within(Some(Duration::ZERO)), 1);
    }
}
