//! Sync engine: the application's single entry point.
//!
//! The engine wires the reachability monitor, status registry, offline
//! queue and sharing coordinator together for one signed-in user, and owns
//! the background drain task. The drain task wakes when a mutation is
//! enqueued, when connectivity comes back, and on a periodic safety-net
//! tick.

use crate::channel::{RecordSyncChannel, SortOrder, Subscription};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{DrainReport, MutationLog, OfflineMutationQueue, PendingMutation};
use crate::reachability::{NetworkReachabilityMonitor, ReachabilityEvent};
use crate::remote::RemoteStore;
use crate::retry::RetryPolicy;
use crate::sharing::{PropagationReport, SharingCoordinator};
use crate::status::{SyncStatusEntry, SyncStatusRegistry};
use hearth_types::{OperationId, RecordId, RecordPayload, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// The sync engine for one signed-in user.
pub struct SyncEngine {
    user: UserId,
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    monitor: Arc<NetworkReachabilityMonitor>,
    registry: Arc<SyncStatusRegistry>,
    queue: Arc<OfflineMutationQueue>,
    sharing: Arc<SharingCoordinator>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Builds the engine and starts its drain task. Mutations left in `log`
    /// by a previous run are restored and drained.
    ///
    /// `remote` must be a session authenticated as `user`.
    pub async fn init(
        user: UserId,
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        log: Arc<dyn MutationLog>,
    ) -> SyncResult<Self> {
        let retry = RetryPolicy::new(&config.retry);
        let monitor = Arc::new(NetworkReachabilityMonitor::new(&config.reachability));
        let registry = Arc::new(SyncStatusRegistry::new(&config.status));

        let queue = OfflineMutationQueue::open(log, remote.clone(), registry.clone(), retry.clone())
            .await?
            .with_reachability(monitor.watch());
        let queue = Arc::new(queue);

        let sharing = SharingCoordinator::new(
            user.clone(),
            remote.clone(),
            retry.clone(),
            registry.clone(),
            config.sharing.clone(),
        );

        let wake = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);
        let drain_task = tokio::spawn(drain_loop(
            queue.clone(),
            registry.clone(),
            wake.clone(),
            monitor.subscribe(),
            stop_rx,
            config.queue.drain_interval(),
        ));

        info!("Sync engine started for {}", user);
        Ok(Self {
            user,
            config,
            remote,
            retry,
            monitor,
            registry,
            queue,
            sharing,
            wake,
            stop,
            drain_task: Mutex::new(Some(drain_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    // ── Live data ────────────────────────────────────────────────

    /// Opens a merged live subscription to `T`'s collection, newest first.
    pub fn open_channel<T: RecordPayload>(&self) -> SyncResult<Subscription<T>> {
        self.open_channel_with_order(SortOrder::default())
    }

    pub fn open_channel_with_order<T: RecordPayload>(
        &self,
        order: SortOrder<T>,
    ) -> SyncResult<Subscription<T>> {
        self.ensure_open()?;
        let channel = RecordSyncChannel::<T>::new(
            self.remote.clone(),
            self.retry.clone(),
            self.config.channel.clone(),
        )
        .with_reachability(self.monitor.clone())
        .with_order(order);
        Ok(channel.open(self.user.clone()))
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Durably queues a write and wakes the drain task.
    pub async fn enqueue_mutation(&self, mutation: PendingMutation) -> SyncResult<OperationId> {
        self.ensure_open()?;
        let operation_id = self.queue.enqueue(mutation).await?;
        self.wake.notify_one();
        Ok(operation_id)
    }

    /// Runs a drain pass now instead of waiting for the drain task.
    pub async fn drain_now(&self) -> SyncResult<DrainReport> {
        self.ensure_open()?;
        self.queue.drain().await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Mutations that failed terminally and block their record.
    pub fn failed_mutations(&self) -> Vec<PendingMutation> {
        self.queue.failed()
    }

    pub async fn retry_failed(&self, operation_id: OperationId) -> SyncResult<()> {
        self.ensure_open()?;
        self.queue.retry_failed(operation_id).await?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn discard_failed(&self, operation_id: OperationId) -> SyncResult<PendingMutation> {
        self.ensure_open()?;
        let discarded = self.queue.discard_failed(operation_id).await?;
        self.wake.notify_one();
        Ok(discarded)
    }

    // ── Collaboration ────────────────────────────────────────────

    pub async fn accept_invitation(
        &self,
        collaboration_id: RecordId,
    ) -> SyncResult<PropagationReport> {
        self.ensure_open()?;
        self.sharing.accept_invitation(collaboration_id).await
    }

    pub async fn decline_invitation(&self, collaboration_id: RecordId) -> SyncResult<()> {
        self.ensure_open()?;
        self.sharing.decline_invitation(collaboration_id).await
    }

    pub async fn revoke_access(&self, collaboration_id: RecordId) -> SyncResult<PropagationReport> {
        self.ensure_open()?;
        self.sharing.revoke_access(collaboration_id).await
    }

    pub fn sharing(&self) -> &Arc<SharingCoordinator> {
        &self.sharing
    }

    // ── Status & connectivity ────────────────────────────────────

    pub fn status_for(&self, operation_id: OperationId) -> Option<SyncStatusEntry> {
        self.registry.status_for(operation_id)
    }

    pub fn all_pending(&self) -> Vec<SyncStatusEntry> {
        self.registry.all_pending()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatusEntry> {
        self.registry.subscribe()
    }

    /// Feeds a raw connectivity observation from the platform.
    pub fn report_connectivity(&self, online: bool) {
        self.monitor.report(online);
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Stops the drain task, reconciliations and the reachability monitor.
    /// Queued mutations stay in the durable log. Safe to call more than
    /// once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.send_replace(true);
        self.queue.close();
        self.sharing.shutdown();
        self.monitor.shutdown();
        let task = self
            .drain_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        info!("Sync engine stopped for {}", self.user);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_loop(
    queue: Arc<OfflineMutationQueue>,
    registry: Arc<SyncStatusRegistry>,
    wake: Arc<Notify>,
    mut reachability: broadcast::Receiver<ReachabilityEvent>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = wake.notified() => debug!("drain woken by enqueue"),
            _ = tick.tick() => {}
            event = reachability.recv() => match event {
                Ok(ReachabilityEvent::BecameOnline) => debug!("drain woken by reconnect"),
                Ok(ReachabilityEvent::BecameOffline) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
        if *stop.borrow() {
            break;
        }

        match queue.drain().await {
            Ok(report) if report.failed > 0 => {
                warn!("{} mutations failed and need attention", report.failed);
            }
            Ok(_) => {}
            Err(e) => warn!("Drain failed: {}", e),
        }
        registry.purge_expired();
    }
    debug!("drain task stopped");
}
