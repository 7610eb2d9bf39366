//! Per-operation sync status for UI and observability.
//!
//! The registry is pure bookkeeping: components that perform an operation
//! report its progress here, and anything else may query or subscribe.
//! Terminal entries are dropped once the retention window has passed.

use crate::config::StatusConfig;
use hearth_types::{OperationId, RecordId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Progress of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Pending,
    Retrying,
    Succeeded,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Succeeded | SyncState::Failed)
    }
}

/// Status of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusEntry {
    pub operation_id: OperationId,
    /// Record the operation touches, when there is a single one.
    pub record_id: Option<RecordId>,
    pub state: SyncState,
    pub last_error: Option<String>,
    pub next_retry_at: Option<Instant>,
    pub updated_at: Instant,
}

/// Thread-safe status bookkeeping.
pub struct SyncStatusRegistry {
    entries: Mutex<HashMap<OperationId, SyncStatusEntry>>,
    retention: Duration,
    changes: broadcast::Sender<SyncStatusEntry>,
}

impl Default for SyncStatusRegistry {
    fn default() -> Self {
        Self::new(&StatusConfig::default())
    }
}

impl SyncStatusRegistry {
    pub fn new(config: &StatusConfig) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: config.retention(),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, SyncStatusEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts tracking an operation as pending.
    pub fn begin(&self, operation_id: OperationId, record_id: Option<RecordId>) {
        let entry = SyncStatusEntry {
            operation_id,
            record_id,
            state: SyncState::Pending,
            last_error: None,
            next_retry_at: None,
            updated_at: Instant::now(),
        };
        self.store(entry);
    }

    /// Records a state change. Unknown operations are tracked from here on.
    pub fn record(&self, operation_id: OperationId, state: SyncState, error: Option<String>) {
        self.update(operation_id, |entry| {
            entry.state = state;
            if error.is_some() || state == SyncState::Succeeded {
                entry.last_error = error;
            }
            entry.next_retry_at = None;
        });
    }

    /// Records a failed attempt that will be retried at `next_retry_at`.
    pub fn record_retry(&self, operation_id: OperationId, error: String, next_retry_at: Instant) {
        self.update(operation_id, |entry| {
            entry.state = SyncState::Retrying;
            entry.last_error = Some(error);
            entry.next_retry_at = Some(next_retry_at);
        });
    }

    fn update(&self, operation_id: OperationId, apply: impl FnOnce(&mut SyncStatusEntry)) {
        let entry = {
            let mut entries = self.lock();
            Self::purge(&mut entries, self.retention);
            let entry = entries
                .entry(operation_id)
                .or_insert_with(|| SyncStatusEntry {
                    operation_id,
                    record_id: None,
                    state: SyncState::Pending,
                    last_error: None,
                    next_retry_at: None,
                    updated_at: Instant::now(),
                });
            apply(entry);
            entry.updated_at = Instant::now();
            entry.clone()
        };
        let _ = self.changes.send(entry);
    }

    fn store(&self, entry: SyncStatusEntry) {
        {
            let mut entries = self.lock();
            Self::purge(&mut entries, self.retention);
            entries.insert(entry.operation_id, entry.clone());
        }
        let _ = self.changes.send(entry);
    }

    fn purge(entries: &mut HashMap<OperationId, SyncStatusEntry>, retention: Duration) {
        let now = Instant::now();
        entries.retain(|_, e| {
            !e.state.is_terminal() || now.saturating_duration_since(e.updated_at) < retention
        });
    }

    /// Returns the status of an operation, if still retained.
    pub fn status_for(&self, operation_id: OperationId) -> Option<SyncStatusEntry> {
        let entries = self.lock();
        entries.get(&operation_id).cloned().filter(|e| {
            !e.state.is_terminal()
                || Instant::now().saturating_duration_since(e.updated_at) < self.retention
        })
    }

    /// Operations that are pending or retrying, oldest first.
    pub fn all_pending(&self) -> Vec<SyncStatusEntry> {
        let mut pending: Vec<_> = self
            .lock()
            .values()
            .filter(|e| !e.state.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.operation_id);
        pending
    }

    /// Retained failed operations, oldest first.
    pub fn failed(&self) -> Vec<SyncStatusEntry> {
        let mut entries = self.lock();
        Self::purge(&mut entries, self.retention);
        let mut failed: Vec<_> = entries
            .values()
            .filter(|e| e.state == SyncState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|e| e.operation_id);
        failed
    }

    /// All retained operations touching a record, oldest first.
    pub fn statuses_for_record(&self, record_id: RecordId) -> Vec<SyncStatusEntry> {
        let mut entries = self.lock();
        Self::purge(&mut entries, self.retention);
        let mut matching: Vec<_> = entries
            .values()
            .filter(|e| e.record_id == Some(record_id))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.operation_id);
        matching
    }

    /// Drops terminal entries older than the retention window. Returns the
    /// number removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        Self::purge(&mut entries, self.retention);
        before - entries.len()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to every status change.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusEntry> {
        self.changes.subscribe()
    }
}
