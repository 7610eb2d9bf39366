use hearth_sync::{
    Fault, MemoryMutationLog, MemoryRemoteStore, MutationKind, MutationLog, OfflineMutationQueue,
    PendingMutation, RetryConfig, RetryPolicy, StatusConfig, SyncError, SyncState,
    SyncStatusRegistry,
};
use hearth_types::{HybridTimestamp, OperationId, Recipe, Record, RecordPayload, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn alice() -> UserId {
    UserId::new("alice").unwrap()
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(&RetryConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter_ratio: 0.0,
        attempt_timeout_ms: 1_000,
        max_attempts: 3,
    })
}

struct Harness {
    backend: MemoryRemoteStore,
    log: MemoryMutationLog,
    registry: Arc<SyncStatusRegistry>,
}

impl Harness {
    fn new() -> Self {
        Self {
            backend: MemoryRemoteStore::new(),
            log: MemoryMutationLog::new(),
            registry: Arc::new(SyncStatusRegistry::new(&StatusConfig::default())),
        }
    }

    async fn queue(&self) -> OfflineMutationQueue {
        OfflineMutationQueue::open(
            Arc::new(self.log.clone()),
            Arc::new(self.backend.session(alice())),
            self.registry.clone(),
            retry(),
        )
        .await
        .unwrap()
    }

    fn stored_title(&self, record: &Record<Recipe>) -> Option<String> {
        self.backend
            .record(Recipe::COLLECTION, record.id)
            .map(|raw| raw.decode::<Recipe>().unwrap().payload.title)
    }
}

fn recipe(title: &str) -> Record<Recipe> {
    Record::new(alice(), Recipe::titled(title))
}

fn renamed(record: &Record<Recipe>, title: &str) -> Record<Recipe> {
    let mut next = record.clone();
    next.payload.title = title.to_string();
    next
}

// ── Enqueue & drain ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enqueue_is_durable_before_returning() {
    let h = Harness::new();
    let queue = h.queue().await;

    let op = queue
        .enqueue(PendingMutation::create(recipe("Porridge")).unwrap())
        .await
        .unwrap();

    assert_eq!(h.log.len(), 1);
    assert_eq!(h.log.read_all().unwrap()[0].operation_id, op);
    assert_eq!(h.registry.status_for(op).unwrap().state, SyncState::Pending);
}

#[tokio::test(start_paused = true)]
async fn drain_applies_in_order() {
    let h = Harness::new();
    let queue = h.queue().await;
    let r = recipe("Porridge");

    let create = queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();
    let update = queue
        .enqueue(PendingMutation::update(renamed(&r, "Oat porridge")).unwrap())
        .await
        .unwrap();

    let report = queue.drain().await.unwrap();

    assert_eq!(report.applied, 2);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.stored_title(&r).as_deref(), Some("Oat porridge"));
    assert!(h.log.is_empty());
    assert_eq!(h.registry.status_for(create).unwrap().state, SyncState::Succeeded);
    assert_eq!(h.registry.status_for(update).unwrap().state, SyncState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn order_follows_enqueue_calls_not_the_wall_clock() {
    let h = Harness::new();
    let r = recipe("Porridge");
    let create = PendingMutation::create(r.clone()).unwrap();
    let mut update = PendingMutation::update(renamed(&r, "Oat porridge")).unwrap();
    // The device clock stepped back between the two edits.
    update.enqueued_at = create.enqueued_at - chrono::Duration::hours(1);

    {
        let queue = h.queue().await;
        queue.enqueue(create.clone()).await.unwrap();
        queue.enqueue(update.clone()).await.unwrap();

        let kinds: Vec<_> = queue.pending().into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Update]);
        queue.close();
    }

    let queue = h.queue().await;
    let order: Vec<_> = queue.pending().into_iter().map(|m| m.operation_id).collect();
    assert_eq!(order, vec![create.operation_id, update.operation_id]);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.superseded, 0);
    assert_eq!(h.stored_title(&r).as_deref(), Some("Oat porridge"));
}

#[tokio::test(start_paused = true)]
async fn delete_of_missing_record_counts_as_applied() {
    let h = Harness::new();
    let queue = h.queue().await;

    queue
        .enqueue(PendingMutation::delete::<Recipe>(recipe("gone").id))
        .await
        .unwrap();

    assert_eq!(queue.drain().await.unwrap().applied, 1);
}

// ── Durability ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn queued_mutations_survive_restart() {
    let h = Harness::new();
    let first = recipe("Soup");
    let second = recipe("Bread");

    {
        let queue = h.queue().await;
        queue.enqueue(PendingMutation::create(first.clone()).unwrap()).await.unwrap();
        queue.enqueue(PendingMutation::create(second.clone()).unwrap()).await.unwrap();
        queue.close();
    }

    let queue = h.queue().await;
    let pending: Vec<_> = queue.pending().into_iter().map(|m| m.record_id).collect();
    assert_eq!(pending, vec![first.id, second.id]);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(h.stored_title(&first).as_deref(), Some("Soup"));
    assert_eq!(h.stored_title(&second).as_deref(), Some("Bread"));
}

#[tokio::test(start_paused = true)]
async fn corrupt_entries_are_dropped_and_reported() {
    let h = Harness::new();
    let corrupt = OperationId::new();
    h.log.append(corrupt, b"{ definitely not a mutation").unwrap();

    let queue = h.queue().await;

    assert!(queue.is_empty());
    assert!(h.log.is_empty());
    assert_eq!(h.registry.status_for(corrupt).unwrap().state, SyncState::Failed);
}

#[tokio::test(start_paused = true)]
async fn newer_format_entries_are_left_alone() {
    let h = Harness::new();
    h.log
        .append(OperationId::new(), br#"{"version": 2, "mutation": {}}"#)
        .unwrap();

    let queue = h.queue().await;

    assert!(queue.is_empty());
    assert_eq!(h.log.len(), 1);
}

// ── Failures ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn terminal_failure_blocks_only_its_record() {
    let h = Harness::new();
    let queue = h.queue().await;
    let blocked = recipe("Pie");
    let other = recipe("Tart");

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Authorization);
    let failed_op = queue
        .enqueue(PendingMutation::create(blocked.clone()).unwrap())
        .await
        .unwrap();
    queue
        .enqueue(PendingMutation::update(renamed(&blocked, "Apple pie")).unwrap())
        .await
        .unwrap();
    queue.enqueue(PendingMutation::create(other.clone()).unwrap()).await.unwrap();

    let report = queue.drain().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.remaining, 1);
    assert!(h.stored_title(&blocked).is_none());
    assert_eq!(h.stored_title(&other).as_deref(), Some("Tart"));

    let status = h.registry.status_for(failed_op).unwrap();
    assert_eq!(status.state, SyncState::Failed);
    assert!(status.last_error.unwrap().contains("authorization"));

    let parked = queue.failed();
    assert_eq!(parked.len(), 1);
    assert!(parked[0].failed);
    assert_eq!(parked[0].attempt_count, 1, "authorization errors are not retried");
}

#[tokio::test(start_paused = true)]
async fn retry_failed_resumes_record_in_order() {
    let h = Harness::new();
    let queue = h.queue().await;
    let r = recipe("Pie");

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Authorization);
    let failed_op = queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();
    queue
        .enqueue(PendingMutation::update(renamed(&r, "Apple pie")).unwrap())
        .await
        .unwrap();
    queue.drain().await.unwrap();

    queue.retry_failed(failed_op).await.unwrap();
    let report = queue.drain().await.unwrap();

    assert_eq!(report.applied, 2);
    assert!(queue.failed().is_empty());
    assert_eq!(h.stored_title(&r).as_deref(), Some("Apple pie"));
    assert!(h.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn discard_failed_unblocks_record() {
    let h = Harness::new();
    let queue = h.queue().await;
    let r = recipe("Pie");

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Authorization);
    let failed_op = queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();
    queue
        .enqueue(PendingMutation::update(renamed(&r, "Apple pie")).unwrap())
        .await
        .unwrap();
    queue.drain().await.unwrap();

    let discarded = queue.discard_failed(failed_op).await.unwrap();
    assert_eq!(discarded.kind, MutationKind::Create);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.stored_title(&r).as_deref(), Some("Apple pie"));
    assert!(matches!(
        queue.discard_failed(failed_op).await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn parked_mutations_stay_parked_across_restart() {
    let h = Harness::new();
    let r = recipe("Pie");
    {
        let queue = h.queue().await;
        h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Authorization);
        queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();
        queue
            .enqueue(PendingMutation::update(renamed(&r, "Apple pie")).unwrap())
            .await
            .unwrap();
        queue.drain().await.unwrap();
    }

    let queue = h.queue().await;
    assert_eq!(queue.failed().len(), 1);
    assert_eq!(queue.len(), 1);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.applied, 0, "record stays blocked after restart");
    assert!(h.stored_title(&r).is_none());
}

#[tokio::test(start_paused = true)]
async fn stale_update_is_superseded() {
    let h = Harness::new();
    let queue = h.queue().await;
    let r = recipe("Soup");
    h.backend.seed(Recipe::COLLECTION, r.clone().into_raw().unwrap());

    let mut stale = renamed(&r, "Cold soup").into_raw().unwrap();
    stale.updated_at = HybridTimestamp::new(1, 0);
    let op = queue
        .enqueue(PendingMutation::upsert(Recipe::COLLECTION, MutationKind::Update, stale).unwrap())
        .await
        .unwrap();

    let report = queue.drain().await.unwrap();

    assert_eq!(report.superseded, 1);
    assert!(queue.failed().is_empty(), "a lost conflict does not block the record");
    assert_eq!(h.stored_title(&r).as_deref(), Some("Soup"));
    let status = h.registry.status_for(op).unwrap();
    assert_eq!(status.state, SyncState::Failed);
    assert!(status.last_error.unwrap().contains("superseded"));
}

#[tokio::test(start_paused = true)]
async fn stalled_write_times_out_and_is_retried() {
    let h = Harness::new();
    let queue = h.queue().await;
    let r = recipe("Slow soup");
    let mut statuses = h.registry.subscribe();

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Stall);
    let op = queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();
    let report = queue.drain().await.unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(h.stored_title(&r).as_deref(), Some("Slow soup"));

    let mut saw_retry = false;
    while let Ok(entry) = statuses.try_recv() {
        if entry.operation_id == op && entry.state == SyncState::Retrying {
            saw_retry = true;
            assert!(entry.last_error.unwrap().contains("timed out"));
        }
    }
    assert!(saw_retry);
}

#[tokio::test(start_paused = true)]
async fn exhausted_network_failures_park_when_still_online() {
    let h = Harness::new();
    let queue = h.queue().await;

    h.backend.fail_next_writes(Recipe::COLLECTION, 3, Fault::Network);
    queue.enqueue(PendingMutation::create(recipe("Soup")).unwrap()).await.unwrap();

    let report = queue.drain().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(queue.failed()[0].attempt_count, 3);
}

// ── Connectivity ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn offline_create_lands_after_reconnect_and_restart() {
    let h = Harness::new();
    let r = recipe("Offline stew");
    let (online_tx, online_rx) = watch::channel(false);

    {
        let queue = h.queue().await.with_reachability(online_rx.clone());
        queue.enqueue(PendingMutation::create(r.clone()).unwrap()).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert!(report.stopped_offline);
        assert_eq!(report.remaining, 1);
        assert_eq!(h.backend.write_count(), 0);
    }

    // App restarts, then the network returns.
    let queue = h.queue().await.with_reachability(online_rx);
    online_tx.send_replace(true);

    let report = queue.drain().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(h.stored_title(&r).as_deref(), Some("Offline stew"));
    assert!(h.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn connectivity_lost_mid_drain_defers() {
    let h = Harness::new();
    let (online_tx, online_rx) = watch::channel(true);
    let queue = h.queue().await.with_reachability(online_rx);

    h.backend.set_online(false);
    let op = queue.enqueue(PendingMutation::create(recipe("Soup")).unwrap()).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        online_tx.send_replace(false);
    });

    let report = queue.drain().await.unwrap();

    assert!(report.stopped_offline);
    assert_eq!(report.failed, 0);
    assert_eq!(queue.len(), 1);
    assert!(queue.failed().is_empty());
    assert_eq!(h.registry.status_for(op).unwrap().state, SyncState::Pending);
    assert_eq!(queue.pending()[0].attempt_count, 3);
}

// ── Concurrency & lifecycle ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn only_one_drain_runs_at_a_time() {
    let h = Harness::new();
    let queue = Arc::new(h.queue().await);

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Stall);
    queue.enqueue(PendingMutation::create(recipe("Soup")).unwrap()).await.unwrap();

    let background = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.drain().await })
    };
    tokio::task::yield_now().await;
    assert!(queue.is_draining());

    let second = queue.drain().await.unwrap();
    assert!(second.already_running);

    let first = background.await.unwrap().unwrap();
    assert_eq!(first.applied, 1);
    assert!(!queue.is_draining());
}

#[tokio::test(start_paused = true)]
async fn closed_queue_rejects_enqueue() {
    let h = Harness::new();
    let queue = h.queue().await;
    queue.close();

    let err = queue
        .enqueue(PendingMutation::create(recipe("Soup")).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Shutdown));
    assert!(h.log.is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_cancels_an_in_flight_write() {
    let h = Harness::new();
    let queue = Arc::new(h.queue().await);

    h.backend.fail_next_writes(Recipe::COLLECTION, 1, Fault::Stall);
    let op = queue.enqueue(PendingMutation::create(recipe("Soup")).unwrap()).await.unwrap();

    let started = tokio::time::Instant::now();
    let background = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(queue.is_draining());

    queue.close();
    let report = background.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(report.applied, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.remaining, 1);
    assert_eq!(h.log.read_all().unwrap()[0].operation_id, op);
    assert!(queue.failed().is_empty());
    assert!(!queue.is_draining());
}
