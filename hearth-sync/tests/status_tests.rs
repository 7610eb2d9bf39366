use hearth_sync::{StatusConfig, SyncState, SyncStatusRegistry};
use hearth_types::{OperationId, RecordId};
use std::time::Duration;
use tokio::time::{Instant, sleep};

fn registry() -> SyncStatusRegistry {
    SyncStatusRegistry::new(&StatusConfig { retention_ms: 1_000 })
}

#[tokio::test(start_paused = true)]
async fn begin_tracks_pending() {
    let reg = registry();
    let op = OperationId::new();
    let record = RecordId::new();

    reg.begin(op, Some(record));

    let entry = reg.status_for(op).unwrap();
    assert_eq!(entry.state, SyncState::Pending);
    assert_eq!(entry.record_id, Some(record));
    assert!(entry.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn retry_then_success() {
    let reg = registry();
    let op = OperationId::new();
    reg.begin(op, None);

    let at = Instant::now() + Duration::from_millis(500);
    reg.record_retry(op, "network error: down".into(), at);
    let entry = reg.status_for(op).unwrap();
    assert_eq!(entry.state, SyncState::Retrying);
    assert_eq!(entry.next_retry_at, Some(at));
    assert_eq!(entry.last_error.as_deref(), Some("network error: down"));

    reg.record(op, SyncState::Succeeded, None);
    let entry = reg.status_for(op).unwrap();
    assert_eq!(entry.state, SyncState::Succeeded);
    assert!(entry.next_retry_at.is_none());
    assert!(entry.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn all_pending_excludes_terminal() {
    let reg = registry();
    let a = OperationId::new();
    let b = OperationId::new();
    let c = OperationId::new();
    for op in [a, b, c] {
        reg.begin(op, None);
    }
    reg.record_retry(b, "timeout".into(), Instant::now());
    reg.record(c, SyncState::Failed, Some("denied".into()));

    let pending: Vec<_> = reg.all_pending().into_iter().map(|e| e.operation_id).collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.contains(&a));
    assert!(pending.contains(&b));
    assert_eq!(reg.failed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_entries_expire() {
    let reg = registry();
    let done = OperationId::new();
    let waiting = OperationId::new();
    reg.begin(done, None);
    reg.begin(waiting, None);
    reg.record(done, SyncState::Succeeded, None);

    sleep(Duration::from_millis(999)).await;
    assert!(reg.status_for(done).is_some());

    sleep(Duration::from_millis(2)).await;
    assert!(reg.status_for(done).is_none());
    assert_eq!(reg.purge_expired(), 1);
    assert!(reg.status_for(waiting).is_some(), "pending entries never expire");
    assert_eq!(reg.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn lookups_by_record() {
    let reg = registry();
    let record = RecordId::new();
    let first = OperationId::new();
    let second = OperationId::new();
    reg.begin(first, Some(record));
    reg.begin(second, Some(record));
    reg.begin(OperationId::new(), Some(RecordId::new()));

    let ops: Vec<_> = reg
        .statuses_for_record(record)
        .into_iter()
        .map(|e| e.operation_id)
        .collect();
    assert_eq!(ops.len(), 2);
    assert!(ops.contains(&first) && ops.contains(&second));
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_every_change() {
    let reg = registry();
    let mut changes = reg.subscribe();
    let op = OperationId::new();

    reg.begin(op, None);
    reg.record(op, SyncState::Failed, Some("denied".into()));

    let first = changes.recv().await.unwrap();
    let second = changes.recv().await.unwrap();
    assert_eq!(first.state, SyncState::Pending);
    assert_eq!(second.state, SyncState::Failed);
    assert_eq!(second.last_error.as_deref(), Some("denied"));
}

#[tokio::test]
async fn unknown_operations_are_tracked_on_first_report() {
    let reg = SyncStatusRegistry::default();
    let op = OperationId::new();

    reg.record(op, SyncState::Failed, Some("corrupt".into()));

    assert_eq!(reg.status_for(op).unwrap().state, SyncState::Failed);
    assert!(!reg.is_empty());
}
