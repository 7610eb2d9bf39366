//! Offline mutation queue.
//!
//! Writes are appended to a durable log before `enqueue` returns and are
//! applied to the remote store in enqueue order by `drain`. Order follows
//! the sequence in which `enqueue` was called (and, after a restart, the
//! log's append order), never the wall clock. Per-record order is
//! strict: a mutation that fails terminally is parked and holds back later
//! mutations of the same record until it is retried or discarded, while
//! other records keep flowing.

pub mod log;
pub mod mutation;

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::status::{SyncState, SyncStatusRegistry};
use hearth_types::{OperationId, RecordId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use log::{LogEntry, MemoryMutationLog, MutationLog, SqliteMutationLog};
pub use mutation::{DecodedEntry, FORMAT_VERSION, MutationKind, PendingMutation};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Mutations confirmed by the remote store.
    pub applied: usize,
    /// Mutations dropped because a newer remote version won.
    pub superseded: usize,
    /// Mutations parked after a terminal failure.
    pub failed: usize,
    /// Mutations still queued after the pass.
    pub remaining: usize,
    /// The pass stopped because connectivity was lost.
    pub stopped_offline: bool,
    /// Another drain was already running; nothing was done.
    pub already_running: bool,
}

/// A mutation tagged with its position in enqueue order.
#[derive(Clone)]
struct Queued {
    seq: u64,
    mutation: PendingMutation,
}

#[derive(Default)]
struct QueueState {
    active: VecDeque<Queued>,
    parked: Vec<Queued>,
}

impl QueueState {
    fn insert_ordered(&mut self, entry: Queued) {
        let at = self.active.partition_point(|q| q.seq <= entry.seq);
        self.active.insert(at, entry);
    }

    fn blocked_records(&self) -> HashSet<(String, RecordId)> {
        self.parked.iter().map(|q| q.mutation.record_key()).collect()
    }

    fn remove_active(&mut self, operation_id: OperationId) -> Option<Queued> {
        let at = self
            .active
            .iter()
            .position(|q| q.mutation.operation_id == operation_id)?;
        self.active.remove(at)
    }

    fn remove_parked(&mut self, operation_id: OperationId) -> Option<Queued> {
        let at = self
            .parked
            .iter()
            .position(|q| q.mutation.operation_id == operation_id)?;
        Some(self.parked.remove(at))
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Outcome {
    Applied,
    Superseded,
    Parked,
    Deferred,
    /// The queue was closed while the mutation was in flight.
    Interrupted,
}

async fn closing(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Durable FIFO of pending writes.
pub struct OfflineMutationQueue {
    log: Arc<dyn MutationLog>,
    remote: Arc<dyn RemoteStore>,
    registry: Arc<SyncStatusRegistry>,
    retry: RetryPolicy,
    online: Option<watch::Receiver<bool>>,
    state: Mutex<QueueState>,
    draining: AtomicBool,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    next_seq: AtomicU64,
}

impl OfflineMutationQueue {
    /// Opens the queue, restoring every mutation found in `log`.
    pub async fn open(
        log: Arc<dyn MutationLog>,
        remote: Arc<dyn RemoteStore>,
        registry: Arc<SyncStatusRegistry>,
        retry: RetryPolicy,
    ) -> SyncResult<Self> {
        let queue = Self {
            log,
            remote,
            registry,
            retry,
            online: None,
            state: Mutex::new(QueueState::default()),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal: watch::Sender::new(false),
            next_seq: AtomicU64::new(0),
        };
        queue.restore().await?;
        Ok(queue)
    }

    /// Gates draining on a connectivity signal.
    #[must_use]
    pub fn with_reachability(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_online(&self) -> bool {
        self.online.as_ref().is_none_or(|rx| *rx.borrow())
    }

    async fn with_log<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MutationLog) -> SyncResult<T> + Send + 'static,
    {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || f(log.as_ref()))
            .await
            .map_err(|e| SyncError::Storage(format!("mutation log task failed: {e}")))?
    }

    async fn restore(&self) -> SyncResult<()> {
        let entries = self.with_log(|log| log.read_all()).await?;
        let mut restored = Vec::with_capacity(entries.len());

        for entry in entries {
            match mutation::decode(&entry.bytes) {
                Ok(DecodedEntry::Mutation(m)) => restored.push(m),
                Ok(DecodedEntry::Unsupported { version }) => {
                    warn!(
                        "Skipping queue entry {} written in format v{}",
                        entry.operation_id, version
                    );
                }
                Err(e) => {
                    warn!("Dropping corrupt queue entry {}: {}", entry.operation_id, e);
                    self.registry
                        .record(entry.operation_id, SyncState::Failed, Some(e.to_string()));
                    let id = entry.operation_id;
                    self.with_log(move |log| log.remove(id)).await?;
                }
            }
        }

        // Entries come back in append order, which is enqueue order.
        let mut state = self.lock();
        for m in restored {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.registry.begin(m.operation_id, Some(m.record_id));
            if m.failed {
                self.registry
                    .record(m.operation_id, SyncState::Failed, m.last_error.clone());
                state.parked.push(Queued { seq, mutation: m });
            } else {
                state.active.push_back(Queued { seq, mutation: m });
            }
        }
        if !state.active.is_empty() || !state.parked.is_empty() {
            info!(
                "Restored {} queued and {} failed mutations",
                state.active.len(),
                state.parked.len()
            );
        }
        Ok(())
    }

    /// Persists a mutation and queues it for the next drain. The mutation is
    /// durable when this returns.
    pub async fn enqueue(&self, mutation: PendingMutation) -> SyncResult<OperationId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        let operation_id = mutation.operation_id;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let bytes = mutation::encode(&mutation)?;
        self.with_log(move |log| log.append(operation_id, &bytes))
            .await?;

        self.registry.begin(operation_id, Some(mutation.record_id));
        debug!(
            "Queued {:?} of {}/{} as {}",
            mutation.kind, mutation.record_type, mutation.record_id, operation_id
        );
        self.lock().insert_ordered(Queued { seq, mutation });
        Ok(operation_id)
    }

    /// Applies queued mutations oldest-first. Only one drain runs at a time;
    /// a concurrent call returns immediately with `already_running` set.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            return Ok(DrainReport {
                already_running: true,
                ..DrainReport::default()
            });
        };

        let mut report = DrainReport::default();
        let mut deferred: HashSet<OperationId> = HashSet::new();

        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if !self.is_online() {
                report.stopped_offline = true;
                break;
            }

            let next = {
                let state = self.lock();
                let blocked = state.blocked_records();
                state
                    .active
                    .iter()
                    .map(|q| &q.mutation)
                    .find(|m| {
                        !blocked.contains(&m.record_key()) && !deferred.contains(&m.operation_id)
                    })
                    .cloned()
            };
            let Some(mutation) = next else {
                break;
            };

            match self.apply_with_retry(&mutation).await? {
                Outcome::Applied => report.applied += 1,
                Outcome::Superseded => report.superseded += 1,
                Outcome::Parked => report.failed += 1,
                Outcome::Deferred => {
                    deferred.insert(mutation.operation_id);
                    report.stopped_offline = true;
                    break;
                }
                Outcome::Interrupted => break,
            }
        }

        report.remaining = self.lock().active.len();
        if report.applied + report.superseded + report.failed > 0 {
            info!(
                "Drain finished: {} applied, {} superseded, {} failed, {} remaining",
                report.applied, report.superseded, report.failed, report.remaining
            );
        }
        Ok(report)
    }

    async fn apply_with_retry(&self, mutation: &PendingMutation) -> SyncResult<Outcome> {
        let operation_id = mutation.operation_id;
        let registry = self.registry.clone();
        let mut tries = 0u32;

        let result = tokio::select! {
            result = self.retry.with_retry_observed(
                self.retry.max_attempts(),
                || {
                    tries += 1;
                    self.apply(mutation)
                },
                |_, err, delay| {
                    registry.record_retry(operation_id, err.to_string(), Instant::now() + delay);
                },
            ) => result,
            _ = closing(self.close_signal.subscribe()) => {
                debug!("Queue closed while mutation {} was in flight", operation_id);
                return Ok(Outcome::Interrupted);
            }
        };

        match result {
            Ok(()) => {
                self.lock().remove_active(operation_id);
                self.with_log(move |log| log.remove(operation_id)).await?;
                self.registry
                    .record(operation_id, SyncState::Succeeded, None);
                debug!("Applied mutation {}", operation_id);
                Ok(Outcome::Applied)
            }
            Err(err) if matches!(err.root(), SyncError::Conflict(_)) => {
                let reason = format!("superseded by a newer remote version: {err}");
                self.lock().remove_active(operation_id);
                self.with_log(move |log| log.remove(operation_id)).await?;
                self.registry
                    .record(operation_id, SyncState::Failed, Some(reason));
                info!("Mutation {} lost to a newer remote write", operation_id);
                Ok(Outcome::Superseded)
            }
            Err(err) if err.root().is_retryable() && !self.is_online() => {
                // Connectivity dropped mid-drain; keep it queued for the next pass.
                let updated = {
                    let mut state = self.lock();
                    state
                        .active
                        .iter_mut()
                        .map(|q| &mut q.mutation)
                        .find(|m| m.operation_id == operation_id)
                        .map(|m| {
                            m.attempt_count += tries;
                            m.last_error = Some(err.to_string());
                            m.clone()
                        })
                };
                if let Some(updated) = updated {
                    let bytes = mutation::encode(&updated)?;
                    self.with_log(move |log| log.update(operation_id, &bytes))
                        .await?;
                }
                self.registry
                    .record(operation_id, SyncState::Pending, Some(err.to_string()));
                Ok(Outcome::Deferred)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    "Mutation {} of {}/{} failed: {}",
                    operation_id, mutation.record_type, mutation.record_id, reason
                );
                let parked = {
                    let mut state = self.lock();
                    state.remove_active(operation_id).map(|mut q| {
                        q.mutation.failed = true;
                        q.mutation.attempt_count += tries;
                        q.mutation.last_error = Some(reason.clone());
                        let parked = q.mutation.clone();
                        state.parked.push(q);
                        parked
                    })
                };
                if let Some(parked) = parked {
                    let bytes = mutation::encode(&parked)?;
                    self.with_log(move |log| log.update(operation_id, &bytes))
                        .await?;
                }
                self.registry
                    .record(operation_id, SyncState::Failed, Some(reason));
                Ok(Outcome::Parked)
            }
        }
    }

    async fn apply(&self, mutation: &PendingMutation) -> SyncResult<()> {
        match mutation.kind {
            MutationKind::Create | MutationKind::Update => {
                let record = mutation.record()?;
                self.remote.write(&mutation.record_type, record).await?;
                Ok(())
            }
            MutationKind::Delete => {
                match self
                    .remote
                    .delete(&mutation.record_type, mutation.record_id)
                    .await
                {
                    Err(SyncError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        }
    }

    /// Moves a parked mutation back into the queue ahead of later mutations
    /// of the same record.
    pub async fn retry_failed(&self, operation_id: OperationId) -> SyncResult<()> {
        let revived = {
            let mut state = self.lock();
            let mut q = state
                .remove_parked(operation_id)
                .ok_or_else(|| SyncError::NotFound(format!("failed mutation {operation_id}")))?;
            q.mutation.failed = false;
            q.mutation.attempt_count = 0;
            q.mutation.last_error = None;
            let revived = q.mutation.clone();
            state.insert_ordered(q);
            revived
        };
        let bytes = mutation::encode(&revived)?;
        self.with_log(move |log| log.update(operation_id, &bytes))
            .await?;
        self.registry.record(operation_id, SyncState::Pending, None);
        Ok(())
    }

    /// Drops a parked mutation for good, unblocking its record.
    pub async fn discard_failed(&self, operation_id: OperationId) -> SyncResult<PendingMutation> {
        let discarded = self
            .lock()
            .remove_parked(operation_id)
            .ok_or_else(|| SyncError::NotFound(format!("failed mutation {operation_id}")))?;
        self.with_log(move |log| log.remove(operation_id)).await?;
        Ok(discarded.mutation)
    }

    /// Mutations waiting to be applied, in drain order.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.lock()
            .active
            .iter()
            .map(|q| q.mutation.clone())
            .collect()
    }

    /// Parked mutations awaiting retry or discard.
    pub fn failed(&self) -> Vec<PendingMutation> {
        self.lock()
            .parked
            .iter()
            .map(|q| q.mutation.clone())
            .collect()
    }

    /// Number of mutations waiting to be applied.
    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while a drain pass is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Stops accepting mutations and cancels a running drain, including any
    /// write or backoff in flight. Queued entries stay in the durable log.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.send_replace(true);
    }
}
