//! Live, merged subscriptions to one collection.
//!
//! Each open subscription is backed by one task holding two live queries:
//! records the user owns and records shared with the user. Their events
//! feed a [`MergedView`]; every change publishes a freshly sorted vector
//! of typed records.

use crate::config::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::merge::{MergedView, Side};
use crate::reachability::{NetworkReachabilityMonitor, ReachabilityEvent};
use crate::remote::{RecordEvent, RecordStream, RemoteStore};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use hearth_types::{Record, RecordPayload, UserId};
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Caller-supplied ordering of typed records.
pub type RecordComparator<T> = Arc<dyn Fn(&Record<T>, &Record<T>) -> Ordering + Send + Sync>;

/// Ordering of a subscription's published records.
pub enum SortOrder<T> {
    /// Newest first, ties broken by id.
    UpdatedAtDesc,
    /// Oldest first, ties broken by id.
    UpdatedAtAsc,
    By(RecordComparator<T>),
}

impl<T> SortOrder<T> {
    pub fn by(compare: impl Fn(&Record<T>, &Record<T>) -> Ordering + Send + Sync + 'static) -> Self {
        SortOrder::By(Arc::new(compare))
    }

    fn sort(&self, records: &mut [Record<T>]) {
        match self {
            SortOrder::UpdatedAtDesc => records.sort_by(|a, b| b.lww_cmp(a)),
            SortOrder::UpdatedAtAsc => records.sort_by(|a, b| a.lww_cmp(b)),
            SortOrder::By(compare) => records.sort_by(|a, b| compare(a, b)),
        }
    }
}

impl<T> Default for SortOrder<T> {
    fn default() -> Self {
        SortOrder::UpdatedAtDesc
    }
}

impl<T> Clone for SortOrder<T> {
    fn clone(&self) -> Self {
        match self {
            SortOrder::UpdatedAtDesc => SortOrder::UpdatedAtDesc,
            SortOrder::UpdatedAtAsc => SortOrder::UpdatedAtAsc,
            SortOrder::By(compare) => SortOrder::By(compare.clone()),
        }
    }
}

impl<T> fmt::Debug for SortOrder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::UpdatedAtDesc => f.write_str("UpdatedAtDesc"),
            SortOrder::UpdatedAtAsc => f.write_str("UpdatedAtAsc"),
            SortOrder::By(_) => f.write_str("By(..)"),
        }
    }
}

/// Connection health of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    /// Initial queries are being opened.
    Connecting,
    /// Both queries are live.
    Live,
    /// At least one query dropped and is being re-opened.
    Reconnecting { attempt: u32 },
    /// A query gave up after too many failed reconnects. It is revived
    /// when connectivity comes back.
    Degraded,
    Closed,
}

/// Opens merged subscriptions to `T::COLLECTION`.
pub struct RecordSyncChannel<T> {
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    config: ChannelConfig,
    reachability: Option<Arc<NetworkReachabilityMonitor>>,
    order: SortOrder<T>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: RecordPayload> RecordSyncChannel<T> {
    pub fn new(remote: Arc<dyn RemoteStore>, retry: RetryPolicy, config: ChannelConfig) -> Self {
        Self {
            remote,
            retry,
            config,
            reachability: None,
            order: SortOrder::default(),
            _payload: PhantomData,
        }
    }

    /// Revives degraded subscriptions when the monitor reports online.
    #[must_use]
    pub fn with_reachability(mut self, monitor: Arc<NetworkReachabilityMonitor>) -> Self {
        self.reachability = Some(monitor);
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: SortOrder<T>) -> Self {
        self.order = order;
        self
    }

    /// Starts a subscription for `user`. Must be called inside a tokio
    /// runtime.
    pub fn open(&self, user: UserId) -> Subscription<T> {
        let (records_tx, records_rx) = watch::channel(Arc::new(Vec::new()));
        let (health_tx, health_rx) = watch::channel(ChannelHealth::Connecting);

        let task = ChannelTask {
            collection: T::COLLECTION,
            remote: self.remote.clone(),
            retry: self.retry.clone(),
            max_reconnects: self.config.max_reconnect_attempts,
            online: self.reachability.as_ref().map(|m| m.subscribe()),
            order: self.order.clone(),
            view: MergedView::new(user.clone()),
            owned: SideState::new(Side::Owned),
            shared: SideState::new(Side::Shared),
            records: records_tx,
            published: false,
            health: health_tx,
            user,
        };

        Subscription {
            records: records_rx,
            health: health_rx,
            task: Mutex::new(Some(tokio::spawn(task.run()))),
        }
    }
}

/// A live merged result set. Dropping it closes the subscription.
pub struct Subscription<T> {
    records: watch::Receiver<Arc<Vec<Record<T>>>>,
    health: watch::Receiver<ChannelHealth>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Subscription<T> {
    /// The latest published records.
    pub fn records(&self) -> Arc<Vec<Record<T>>> {
        self.records.borrow().clone()
    }

    /// Waits for the next publication.
    pub async fn changed(&mut self) -> SyncResult<Arc<Vec<Record<T>>>> {
        self.records
            .changed()
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok(self.records.borrow_and_update().clone())
    }

    /// Waits until the published records satisfy `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&[Record<T>]) -> bool,
    ) -> SyncResult<Arc<Vec<Record<T>>>> {
        let records = self
            .records
            .wait_for(|records| predicate(records))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok(records.clone())
    }

    pub fn health(&self) -> ChannelHealth {
        if self.is_closed() {
            return ChannelHealth::Closed;
        }
        *self.health.borrow()
    }

    /// Waits until the health satisfies `predicate`.
    pub async fn wait_for_health(
        &mut self,
        mut predicate: impl FnMut(ChannelHealth) -> bool,
    ) -> SyncResult<ChannelHealth> {
        let health = self
            .health
            .wait_for(|health| predicate(*health))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        Ok(*health)
    }

    pub fn is_closed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Cancels both live queries and any pending reconnect. Safe to call
    /// more than once.
    pub fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

struct SideState {
    side: Side,
    stream: Option<RecordStream>,
    failures: u32,
    retry_at: Option<Instant>,
    degraded: bool,
    /// A snapshot has been received on this side.
    synced: bool,
}

impl SideState {
    fn new(side: Side) -> Self {
        Self {
            side,
            stream: None,
            failures: 0,
            retry_at: None,
            degraded: false,
            synced: false,
        }
    }
}

struct ChannelTask<T> {
    collection: &'static str,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    max_reconnects: u32,
    online: Option<broadcast::Receiver<ReachabilityEvent>>,
    order: SortOrder<T>,
    user: UserId,
    view: MergedView,
    owned: SideState,
    shared: SideState,
    records: watch::Sender<Arc<Vec<Record<T>>>>,
    published: bool,
    health: watch::Sender<ChannelHealth>,
}

impl<T: RecordPayload> ChannelTask<T> {
    async fn run(mut self) {
        self.connect(Side::Owned).await;
        self.connect(Side::Shared).await;

        loop {
            tokio::select! {
                event = next_event(&mut self.owned.stream) => self.on_event(Side::Owned, event),
                event = next_event(&mut self.shared.stream) => self.on_event(Side::Shared, event),
                _ = sleep_until(self.owned.retry_at) => self.connect(Side::Owned).await,
                _ = sleep_until(self.shared.retry_at) => self.connect(Side::Shared).await,
                event = recv_reachability(&mut self.online) => match event {
                    Ok(ReachabilityEvent::BecameOnline) => self.revive(),
                    Ok(ReachabilityEvent::BecameOffline) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => self.online = None,
                },
            }
        }
    }

    fn side(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Owned => &mut self.owned,
            Side::Shared => &mut self.shared,
        }
    }

    async fn connect(&mut self, side: Side) {
        self.side(side).retry_at = None;
        let query = side.query(&self.user);
        let opened = tokio::time::timeout(
            self.retry.attempt_timeout(),
            self.remote.subscribe(self.collection, query),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout));

        match opened {
            Ok(stream) => {
                debug!("{} {:?} query open for {}", self.collection, side, self.user);
                let state = self.side(side);
                state.stream = Some(stream);
                state.failures = 0;
                state.degraded = false;
                self.publish_health();
            }
            Err(err) => self.on_failure(side, err),
        }
    }

    fn on_event(&mut self, side: Side, event: Option<SyncResult<RecordEvent>>) {
        match event {
            Some(Ok(event)) => {
                let snapshot = matches!(event, RecordEvent::Snapshot(_));
                let changed = self.view.apply(side, event);
                let state = self.side(side);
                state.failures = 0;
                state.synced |= snapshot;
                // The initial state is published even when both sides are empty.
                let initial = !self.published && self.owned.synced && self.shared.synced;
                if changed || initial {
                    self.publish_records();
                }
                self.publish_health();
            }
            Some(Err(err)) => self.on_failure(side, err),
            None => self.on_failure(side, SyncError::Network("subscription ended".into())),
        }
    }

    fn on_failure(&mut self, side: Side, err: SyncError) {
        if err.is_authorization() && self.view.clear(Side::Shared) {
            info!(
                "{} access revoked for {}, cleared shared records",
                self.collection, self.user
            );
            self.publish_records();
        }

        let max_reconnects = self.max_reconnects;
        let delay = {
            let state = self.side(side);
            state.stream = None;
            state.failures += 1;
            if state.failures > max_reconnects {
                state.degraded = true;
                state.retry_at = None;
                None
            } else {
                Some(state.failures)
            }
        };

        match delay {
            Some(failures) => {
                let delay = self.retry.compute_delay(failures - 1);
                warn!(
                    "{} {:?} query failed ({}), reconnecting in {:?}",
                    self.collection, side, err, delay
                );
                self.side(side).retry_at = Some(Instant::now() + delay);
            }
            None => warn!(
                "{} {:?} query degraded after {} reconnect attempts: {}",
                self.collection, side, max_reconnects, err
            ),
        }
        self.publish_health();
    }

    fn revive(&mut self) {
        let now = Instant::now();
        for state in [&mut self.owned, &mut self.shared] {
            if state.stream.is_none() {
                debug!("reviving {:?} query", state.side);
                state.degraded = false;
                state.failures = 0;
                state.retry_at = Some(now);
            }
        }
        self.publish_health();
    }

    fn publish_records(&mut self) {
        self.published = true;
        let mut records: Vec<Record<T>> = Vec::new();
        for raw in self.view.records() {
            let id = raw.id;
            match raw.decode::<T>() {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping malformed {} record {}: {}", self.collection, id, e),
            }
        }
        self.order.sort(&mut records);
        self.records.send_replace(Arc::new(records));
    }

    fn publish_health(&self) {
        let sides = [&self.owned, &self.shared];
        let health = if sides.iter().any(|s| s.degraded) {
            ChannelHealth::Degraded
        } else if sides.iter().any(|s| s.stream.is_none()) {
            let attempt = sides.iter().map(|s| s.failures).max().unwrap_or(0);
            if attempt == 0 {
                ChannelHealth::Connecting
            } else {
                ChannelHealth::Reconnecting { attempt }
            }
        } else {
            ChannelHealth::Live
        };
        self.health.send_if_modified(|current| {
            if *current == health {
                false
            } else {
                *current = health;
                true
            }
        });
    }
}

async fn next_event(stream: &mut Option<RecordStream>) -> Option<SyncResult<RecordEvent>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_reachability(
    rx: &mut Option<broadcast::Receiver<ReachabilityEvent>>,
) -> Result<ReachabilityEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
