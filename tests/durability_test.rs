
use std::sync::Arc;
use test_utils::*;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use vbucket_driver::durability::PollSettings;
use vbucket_driver::transport::NodeClient;
use vbucket_driver::types::KeyState;
use vbucket_driver::{
    ConfigurationProvider, DurabilityError, DurabilityPoller, DurabilityRequest, NodeState,
    ObserveOutcome, OperationRouter, PersistTo, ReplicateTo,
};

const CAS: u64 = 42;

async fn setup(descriptor: String) -> (Arc<ConfigurationProvider>, Arc<FakeNodeClient>, DurabilityPoller) {
    let provider = bootstrapped_provider(descriptor).await;
    let nodes = FakeNodeClient::new();
    let client: Arc<dyn NodeClient> = nodes.clone();
    let poller = DurabilityPoller::new(
        OperationRouter::new(Arc::clone(&provider)),
        client,
        PollSettings::from_config(&test_config()),
    );
    (provider, nodes, poller)
}

#[tokio::test]
async fn test_trivial_request_sends_nothing() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;

    let request = DurabilityRequest::new("user::1", CAS);
    poller.confirm_durability(&request, None).await.unwrap();

    assert_eq!(nodes.observe_calls(), 0);
}

#[tokio::test]
async fn test_persist_to_master_on_single_node() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A], 0, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);

    let request = DurabilityRequest::new("user::1", CAS).persist_to(PersistTo::Master);
    poller.confirm_durability(&request, None).await.unwrap();

    assert_eq!(nodes.observe_calls(), 1);
}

#[tokio::test]
async fn test_delete_is_durable_once_not_found_persisted() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A], 0, 8)).await;
    // a deleted key no longer carries the mutation's cas
    nodes.always(NODE_A, 0, KeyState::NotFoundPersisted);

    let request = DurabilityRequest::new("user::1", CAS)
        .persist_to(PersistTo::Master)
        .delete();
    poller.confirm_durability(&request, None).await.unwrap();
}

#[tokio::test]
async fn test_modified_primary_fails_after_one_round() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B, NODE_C], 2, 8)).await;
    nodes.always(NODE_A, CAS + 1, KeyState::FoundPersisted);
    nodes.always(NODE_B, CAS, KeyState::FoundPersisted);
    nodes.always(NODE_C, CAS, KeyState::FoundPersisted);

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::Two);
    let result = poller.confirm_durability(&request, None).await;

    assert!(matches!(
        result,
        Err(DurabilityError::ModifiedConflict { rounds: 1, cas: CAS, .. })
    ));
    assert_eq!(nodes.observe_calls(), 3);
}

#[tokio::test]
async fn test_replication_confirmed_after_several_rounds() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundNotPersisted);
    nodes.on_observe(
        NODE_B,
        Box::new(|call: usize| {
            if call >= 2 {
                Some((CAS, KeyState::FoundNotPersisted))
            } else {
                Some((0, KeyState::NotFoundNotPersisted))
            }
        }),
    );

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    poller.confirm_durability(&request, None).await.unwrap();

    // three rounds of two observes each
    assert_eq!(nodes.observe_calls(), 6);
}

#[tokio::test]
async fn test_persistence_needs_replica_and_master() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.on_observe(
        NODE_A,
        Box::new(|call: usize| {
            let state = if call >= 1 {
                KeyState::FoundPersisted
            } else {
                KeyState::FoundNotPersisted
            };
            Some((CAS, state))
        }),
    );
    nodes.always(NODE_B, CAS, KeyState::FoundPersisted);

    let request = DurabilityRequest::new("user::1", CAS).persist_to(PersistTo::Two);
    poller.confirm_durability(&request, None).await.unwrap();

    assert_eq!(nodes.observe_calls(), 4);
}

#[tokio::test]
async fn test_silent_replica_times_out_after_round_budget() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);

    let settings = poller.settings();
    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    let started = Instant::now();
    let result = poller.confirm_durability(&request, None).await;
    let waited = started.elapsed();

    match result {
        Err(DurabilityError::ObserveTimeout { attempts, elapsed, .. }) => {
            assert_eq!(attempts, settings.max_attempts);
            assert!(elapsed >= settings.interval * settings.max_attempts);
            assert!(elapsed <= waited);
        }
        other => panic!("expected ObserveTimeout, got {:?}", other),
    }
    assert_eq!(nodes.observe_calls(), 2 * settings.max_attempts as usize);
    assert!(waited < Duration::from_secs(2));
}

#[tokio::test]
async fn test_caller_timeout_bounds_rounds() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    let result = poller
        .confirm_durability(&request, Some(Duration::from_millis(30)))
        .await;

    match result {
        Err(DurabilityError::ObserveTimeout { attempts, elapsed, .. }) => {
            assert!((1..=6).contains(&attempts));
            assert!(elapsed >= Duration::from_millis(25));
        }
        other => panic!("expected ObserveTimeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hung_replica_cannot_stretch_caller_timeout() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);
    nodes.hang_observe(NODE_B);

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    let started = Instant::now();
    let result = poller
        .confirm_durability(&request, Some(Duration::from_millis(50)))
        .await;
    let waited = started.elapsed();

    match result {
        Err(DurabilityError::ObserveTimeout { attempts, .. }) => assert_eq!(attempts, 1),
        other => panic!("expected ObserveTimeout, got {:?}", other),
    }
    // a single round may wait up to the 200ms operation timeout
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
}

#[tokio::test]
async fn test_hung_replica_does_not_hide_primary_reply() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);
    nodes.hang_observe(NODE_B);

    let started = Instant::now();
    let outcomes = poller.observe("user::1", CAS).await.unwrap();
    assert_eq!(outcomes[NODE_A], ObserveOutcome::FoundPersisted);
    assert_eq!(outcomes[NODE_B], ObserveOutcome::Error);
    assert!(started.elapsed() >= poller.settings().round_timeout);

    // the round closes at its deadline and still counts the primary
    let request = DurabilityRequest::new("user::1", CAS).persist_to(PersistTo::Master);
    poller.confirm_durability(&request, None).await.unwrap();
    assert_eq!(nodes.observe_calls(), 4);
}

#[tokio::test]
async fn test_too_few_replicas_fails_without_observing() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::Two);
    assert!(matches!(
        poller.confirm_durability(&request, None).await,
        Err(DurabilityError::InsufficientReplicas { available: 1, .. })
    ));

    let request = DurabilityRequest::new("user::1", CAS).persist_to(PersistTo::Three);
    assert!(matches!(
        poller.confirm_durability(&request, None).await,
        Err(DurabilityError::InsufficientReplicas { available: 1, .. })
    ));

    assert_eq!(nodes.observe_calls(), 0);
}

#[tokio::test]
async fn test_simple_bucket_cannot_persist() {
    let descriptor = r#"{
        "name": "cache",
        "nodeLocator": "ketama",
        "nodes": [{"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}}]
    }"#;
    let (_, nodes, poller) = setup(descriptor.to_string()).await;

    let request = DurabilityRequest::new("user::1", CAS).persist_to(PersistTo::Master);
    assert!(matches!(
        poller.confirm_durability(&request, None).await,
        Err(DurabilityError::InsufficientReplicas { available: 0, .. })
    ));
    assert_eq!(nodes.observe_calls(), 0);
}

#[tokio::test]
async fn test_losing_a_replica_mid_poll_fails_fast() {
    let (provider, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);

    let shrink = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(provider.mark_node(NODE_B, NodeState::Inactive));
    });

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    let result = poller.confirm_durability(&request, None).await;
    shrink.await.unwrap();

    assert!(matches!(
        result,
        Err(DurabilityError::InsufficientReplicas { available: 0, .. })
    ));
    assert!(nodes.observe_calls() < 2 * poller.settings().max_attempts as usize);
}

#[tokio::test]
async fn test_cancellation_interrupts_polling() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B], 1, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);

    let (cancel, cancelled) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = cancel.send(true);
    });

    let request = DurabilityRequest::new("user::1", CAS).replicate_to(ReplicateTo::One);
    let result = poller
        .confirm_durability_cancellable(&request, None, cancelled)
        .await;

    match result {
        Err(DurabilityError::ObserveInterrupted { rounds, .. }) => {
            assert!(rounds >= 1 && rounds < poller.settings().max_attempts);
        }
        other => panic!("expected ObserveInterrupted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_observe_reports_each_node() {
    let (_, nodes, poller) = setup(uniform_descriptor(1, &[NODE_A, NODE_B, NODE_C], 2, 8)).await;
    nodes.always(NODE_A, CAS, KeyState::FoundPersisted);
    nodes.always(NODE_B, CAS + 7, KeyState::FoundNotPersisted);

    let outcomes = poller.observe("user::1", CAS).await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[NODE_A], ObserveOutcome::FoundPersisted);
    assert_eq!(outcomes[NODE_B], ObserveOutcome::Modified);
    assert_eq!(outcomes[NODE_C], ObserveOutcome::Error);
}
