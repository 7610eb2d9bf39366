use hearth_sync::{
    ChannelHealth, Fault, MemoryMutationLog, MemoryRemoteStore, PendingMutation, RetryConfig,
    SyncConfig, SyncEngine, SyncError, SyncState,
};
use hearth_types::{ChildProfile, Collaboration, ProfileId, Recipe, Record, RecordPayload, UserId};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
            attempt_timeout_ms: 1_000,
            max_attempts: 3,
        },
        ..SyncConfig::default()
    }
}

async fn start(backend: &MemoryRemoteStore, who: &str, log: &MemoryMutationLog) -> SyncEngine {
    init_tracing();
    SyncEngine::init(
        user(who),
        config(),
        Arc::new(backend.session(user(who))),
        Arc::new(log.clone()),
    )
    .await
    .unwrap()
}

/// Lets the drain task and the reachability debounce run.
async fn settle() {
    sleep(Duration::from_secs(2)).await;
}

// ── Writes ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enqueued_write_reaches_the_store() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let engine = start(&backend, "alice", &log).await;
    let mut status = engine.subscribe_status();

    let record = Record::new(user("alice"), Recipe::titled("Porridge"));
    let op = engine
        .enqueue_mutation(PendingMutation::create(record.clone()).unwrap())
        .await
        .unwrap();
    settle().await;

    assert!(backend.record(Recipe::COLLECTION, record.id).is_some());
    assert_eq!(engine.queue_len(), 0);
    assert!(log.is_empty());
    assert_eq!(engine.status_for(op).unwrap().state, SyncState::Succeeded);
    assert!(engine.all_pending().is_empty());

    let mut seen = Vec::new();
    while let Ok(entry) = status.try_recv() {
        if entry.operation_id == op {
            seen.push(entry.state);
        }
    }
    assert_eq!(seen.first(), Some(&SyncState::Pending));
    assert_eq!(seen.last(), Some(&SyncState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn offline_create_is_applied_after_reconnect() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let engine = start(&backend, "alice", &log).await;

    backend.set_online(false);
    engine.report_connectivity(false);
    settle().await;
    assert!(!engine.is_online());

    let record = Record::new(user("alice"), Recipe::titled("Offline stew"));
    let op = engine
        .enqueue_mutation(PendingMutation::create(record.clone()).unwrap())
        .await
        .unwrap();
    settle().await;

    assert!(backend.record(Recipe::COLLECTION, record.id).is_none());
    assert_eq!(engine.queue_len(), 1);
    assert_eq!(engine.all_pending().len(), 1);

    backend.set_online(true);
    engine.report_connectivity(true);
    settle().await;

    assert!(engine.is_online());
    assert!(backend.record(Recipe::COLLECTION, record.id).is_some());
    assert_eq!(engine.queue_len(), 0);
    assert_eq!(engine.status_for(op).unwrap().state, SyncState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn queued_writes_survive_a_restart() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let record = Record::new(user("alice"), Recipe::titled("Leftovers"));

    {
        let engine = start(&backend, "alice", &log).await;
        engine.report_connectivity(false);
        settle().await;
        engine
            .enqueue_mutation(PendingMutation::create(record.clone()).unwrap())
            .await
            .unwrap();
        engine.shutdown();
    }
    assert_eq!(log.len(), 1);
    assert!(backend.record(Recipe::COLLECTION, record.id).is_none());

    let engine = start(&backend, "alice", &log).await;
    settle().await;

    assert!(backend.record(Recipe::COLLECTION, record.id).is_some());
    assert_eq!(engine.queue_len(), 0);
    assert!(log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_write_can_be_retried() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let engine = start(&backend, "alice", &log).await;
    backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Authorization);

    let record = Record::new(user("alice"), Recipe::titled("Flan"));
    let op = engine
        .enqueue_mutation(PendingMutation::create(record.clone()).unwrap())
        .await
        .unwrap();
    settle().await;

    let failed = engine.failed_mutations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].operation_id, op);
    assert_eq!(engine.status_for(op).unwrap().state, SyncState::Failed);

    engine.retry_failed(op).await.unwrap();
    settle().await;

    assert!(engine.failed_mutations().is_empty());
    assert!(backend.record(Recipe::COLLECTION, record.id).is_some());
    assert_eq!(engine.status_for(op).unwrap().state, SyncState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn failed_write_can_be_discarded() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let engine = start(&backend, "alice", &log).await;

    // Records owned by someone else are refused by the store.
    let foreign = Record::new(user("carol"), Recipe::titled("Not mine"));
    let op = engine
        .enqueue_mutation(PendingMutation::create(foreign).unwrap())
        .await
        .unwrap();
    settle().await;
    assert_eq!(engine.failed_mutations().len(), 1);

    let discarded = engine.discard_failed(op).await.unwrap();

    assert_eq!(discarded.operation_id, op);
    assert!(engine.failed_mutations().is_empty());
    assert!(log.is_empty());
    assert!(matches!(
        engine.discard_failed(op).await,
        Err(SyncError::NotFound(_))
    ));
}

// ── Collaboration ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn accepted_invitation_shows_shared_recipes() {
    let backend = MemoryRemoteStore::new();
    let profile_id = ProfileId::new();
    let invitation = Collaboration::invite(profile_id, user("alice"), user("bob"));
    backend.seed(
        ChildProfile::COLLECTION,
        Record::new(
            user("alice"),
            ChildProfile {
                profile_id,
                name: "Maya".into(),
                extra: Map::new(),
            },
        )
        .with_id(invitation.profile_record_id())
        .into_raw()
        .unwrap(),
    );
    let collaboration = backend.seed(
        Collaboration::COLLECTION,
        Record::new(user("alice"), invitation)
            .shared_with(user("bob"))
            .into_raw()
            .unwrap(),
    );
    backend.seed(
        Recipe::COLLECTION,
        Record::new(user("alice"), Recipe::titled("Lentil soup"))
            .into_raw()
            .unwrap(),
    );

    let log = MemoryMutationLog::new();
    let bob = start(&backend, "bob", &log).await;
    let mut recipes = bob.open_channel::<Recipe>().unwrap();
    recipes
        .wait_for_health(|h| h == ChannelHealth::Live)
        .await
        .unwrap();
    assert!(recipes.records().is_empty());

    let report = bob.accept_invitation(collaboration.id).await.unwrap();
    assert!(report.is_complete());

    let records = recipes.wait_for(|r| r.len() == 1).await.unwrap();
    assert_eq!(records[0].payload.title, "Lentil soup");
    assert_eq!(records[0].owner_id, user("alice"));
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_final() {
    let backend = MemoryRemoteStore::new();
    let log = MemoryMutationLog::new();
    let engine = start(&backend, "alice", &log).await;

    engine.shutdown();
    engine.shutdown();

    let record = Record::new(user("alice"), Recipe::titled("Too late"));
    assert!(matches!(
        engine
            .enqueue_mutation(PendingMutation::create(record).unwrap())
            .await,
        Err(SyncError::Shutdown)
    ));
    assert!(matches!(engine.drain_now().await, Err(SyncError::Shutdown)));
    assert!(matches!(
        engine.open_channel::<Recipe>(),
        Err(SyncError::Shutdown)
    ));
    assert!(log.is_empty());
}
