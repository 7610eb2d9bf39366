//! In-process remote store.
//!
//! Behaves like the hosted document store closely enough to exercise the
//! engine: per-user sessions, ownership and collaboration permission
//! checks, server timestamps, last-write-wins conflict detection and live
//! subscriptions. Faults can be injected to simulate an offline backend,
//! failing writes, stalled calls and dropped subscriptions.

use super::{Query, RecordEvent, RecordStream, RemoteStore};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use hearth_types::{
    Collaboration, HybridTimestamp, RawRecord, RecordId, RecordPayload, UserId,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// An injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a network error.
    Network,
    /// Fail with an authorization error.
    Authorization,
    /// Never complete, so only the caller's timeout ends the call.
    Stall,
}

impl Fault {
    fn into_error(self, context: &str) -> SyncError {
        match self {
            Fault::Network => SyncError::Network(format!("injected: {context}")),
            Fault::Authorization => SyncError::Authorization(format!("injected: {context}")),
            Fault::Stall => SyncError::Timeout,
        }
    }
}

struct Subscriber {
    user: UserId,
    collection: String,
    query: Query,
    tx: mpsc::UnboundedSender<SyncResult<RecordEvent>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<RecordId, RawRecord>>,
    subscribers: Vec<Subscriber>,
    offline: bool,
    write_faults: HashMap<String, VecDeque<Fault>>,
    writes: usize,
    subscribes: usize,
}

/// Server timestamp for an accepted write: the writer's own timestamp, or
/// the next tick after the replaced copy when that would not move forward.
fn stamp(existing: Option<&RawRecord>, incoming: HybridTimestamp) -> HybridTimestamp {
    match existing {
        Some(existing) if existing.updated_at >= incoming => existing.updated_at.tick(),
        _ => incoming,
    }
}

impl Inner {
    fn has_accepted_collaboration(&self, a: &UserId, b: &UserId) -> bool {
        self.collections
            .get(Collaboration::COLLECTION)
            .into_iter()
            .flat_map(|records| records.values())
            .filter_map(|raw| raw.decode::<Collaboration>().ok())
            .any(|c| c.payload.status.is_active() && c.payload.connects(a, b))
    }

    fn publish(&mut self, collection: &str, before: Option<&RawRecord>, after: Option<&RawRecord>) {
        self.subscribers.retain(|sub| {
            if sub.collection != collection {
                return !sub.tx.is_closed();
            }
            let was = before.is_some_and(|r| sub.query.matches(r));
            let is = after.is_some_and(|r| sub.query.matches(r));
            let event = match (was, is, before, after) {
                (_, true, _, Some(record)) => Some(RecordEvent::Upserted(record.clone())),
                (true, false, Some(record), _) => Some(RecordEvent::Removed(record.id)),
                _ => None,
            };
            match event {
                Some(event) => sub.tx.unbounded_send(Ok(event)).is_ok(),
                None => !sub.tx.is_closed(),
            }
        });
    }

    fn interrupt(&mut self, fault: Fault, filter: impl Fn(&Subscriber) -> bool) -> usize {
        let mut interrupted = 0;
        self.subscribers.retain(|sub| {
            if !filter(sub) {
                return true;
            }
            if fault != Fault::Stall {
                let _ = sub
                    .tx
                    .unbounded_send(Err(fault.into_error("subscription interrupted")));
            }
            sub.tx.close_channel();
            interrupted += 1;
            false
        });
        interrupted
    }
}

/// Shared backend. Clone it freely; every clone sees the same data.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens a session acting as `user`.
    pub fn session(&self, user: UserId) -> MemorySession {
        MemorySession {
            store: self.clone(),
            user,
        }
    }

    /// Stores a record directly, bypassing permission checks. Returns the
    /// stamped copy.
    pub fn seed(&self, collection: &str, mut record: RawRecord) -> RawRecord {
        let mut inner = self.lock();
        let records = inner.collections.entry(collection.to_string()).or_default();
        record.updated_at = stamp(records.get(&record.id), record.updated_at);
        let before = records.insert(record.id, record.clone());
        inner.publish(collection, before.as_ref(), Some(&record));
        record
    }

    /// Returns a stored record.
    pub fn record(&self, collection: &str, id: RecordId) -> Option<RawRecord> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|records| records.get(&id))
            .cloned()
    }

    /// Returns every record in a collection.
    pub fn records(&self, collection: &str) -> Vec<RawRecord> {
        self.lock()
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Takes the backend offline or brings it back. Going offline breaks
    /// every live subscription with a network error.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.lock();
        inner.offline = !online;
        if !online {
            inner.interrupt(Fault::Network, |_| true);
        }
    }

    pub fn is_online(&self) -> bool {
        !self.lock().offline
    }

    /// Makes the next `count` writes or deletes in `collection` fail with
    /// `fault`.
    pub fn fail_next_writes(&self, collection: &str, count: usize, fault: Fault) {
        let mut inner = self.lock();
        let faults = inner.write_faults.entry(collection.to_string()).or_default();
        faults.extend(std::iter::repeat_n(fault, count));
    }

    /// Breaks live subscriptions of `user` that match `query_owned` (true for
    /// the owned query, false for the shared query). Returns how many were
    /// interrupted.
    pub fn interrupt_subscriptions(
        &self,
        collection: &str,
        user: &UserId,
        query_owned: bool,
        fault: Fault,
    ) -> usize {
        self.lock().interrupt(fault, |sub| {
            sub.collection == collection
                && &sub.user == user
                && matches!(sub.query, Query::OwnedBy(_)) == query_owned
        })
    }

    /// Number of accepted writes and deletes.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of subscriptions opened so far.
    pub fn subscribe_count(&self) -> usize {
        self.lock().subscribes
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        inner.subscribers.len()
    }
}

/// A [`RemoteStore`] session acting as one user.
#[derive(Clone)]
pub struct MemorySession {
    store: MemoryRemoteStore,
    user: UserId,
}

impl MemorySession {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn backend(&self) -> &MemoryRemoteStore {
        &self.store
    }

    fn ensure_online(inner: &Inner) -> SyncResult<()> {
        if inner.offline {
            return Err(SyncError::Network("remote store unreachable".into()));
        }
        Ok(())
    }

    fn take_fault(inner: &mut Inner, collection: &str) -> Option<Fault> {
        inner
            .write_faults
            .get_mut(collection)
            .and_then(|faults| faults.pop_front())
    }

    fn check_write(&self, inner: &Inner, existing: Option<&RawRecord>, record: &RawRecord) -> SyncResult<()> {
        record
            .validate()
            .map_err(|e| SyncError::MalformedPayload(e.to_string()))?;

        let Some(existing) = existing else {
            if record.owner_id != self.user {
                return Err(SyncError::Authorization(format!(
                    "{} cannot create records owned by {}",
                    self.user, record.owner_id
                )));
            }
            return Ok(());
        };

        if existing.owner_id != record.owner_id {
            return Err(SyncError::Authorization(format!(
                "owner of {} is immutable",
                record.id
            )));
        }

        if !existing.is_writable_by(&self.user) {
            // A collaborator accepting an invitation may add itself to the
            // owner's records, and nothing else.
            let only_self_added = existing.payload == record.payload
                && record.shared_with.contains(&self.user)
                && record
                    .shared_with
                    .iter()
                    .filter(|u| *u != &self.user)
                    .eq(existing.shared_with.iter());
            if !(only_self_added && inner.has_accepted_collaboration(&self.user, &existing.owner_id)) {
                return Err(SyncError::Authorization(format!(
                    "{} has no access to {}",
                    self.user, record.id
                )));
            }
        }

        if existing.updated_at > record.updated_at {
            return Err(SyncError::Conflict(format!(
                "{} was modified remotely after this change",
                record.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemorySession {
    async fn subscribe(&self, collection: &str, query: Query) -> SyncResult<RecordStream> {
        let mut inner = self.store.lock();
        Self::ensure_online(&inner)?;
        inner.subscribes += 1;

        let (tx, rx) = mpsc::unbounded();
        let snapshot: Vec<RawRecord> = inner
            .collections
            .get(collection)
            .into_iter()
            .flat_map(|records| records.values())
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        let _ = tx.unbounded_send(Ok(RecordEvent::Snapshot(snapshot)));

        inner.subscribers.push(Subscriber {
            user: self.user.clone(),
            collection: collection.to_string(),
            query,
            tx,
        });
        Ok(rx.boxed())
    }

    async fn list(&self, collection: &str, query: Query) -> SyncResult<Vec<RawRecord>> {
        let inner = self.store.lock();
        Self::ensure_online(&inner)?;
        Ok(inner
            .collections
            .get(collection)
            .into_iter()
            .flat_map(|records| records.values())
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn get(&self, collection: &str, id: RecordId) -> SyncResult<RawRecord> {
        let inner = self.store.lock();
        Self::ensure_online(&inner)?;
        inner
            .collections
            .get(collection)
            .and_then(|records| records.get(&id))
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{collection}/{id}")))
    }

    async fn write(&self, collection: &str, mut record: RawRecord) -> SyncResult<RawRecord> {
        let stalled = {
            let mut inner = self.store.lock();
            Self::ensure_online(&inner)?;
            match Self::take_fault(&mut inner, collection) {
                Some(Fault::Stall) => true,
                Some(fault) => return Err(fault.into_error("write")),
                None => {
                    let existing = inner
                        .collections
                        .get(collection)
                        .and_then(|records| records.get(&record.id))
                        .cloned();
                    self.check_write(&inner, existing.as_ref(), &record)?;

                    record.updated_at = stamp(existing.as_ref(), record.updated_at);
                    inner
                        .collections
                        .entry(collection.to_string())
                        .or_default()
                        .insert(record.id, record.clone());
                    inner.writes += 1;
                    inner.publish(collection, existing.as_ref(), Some(&record));
                    false
                }
            }
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        Ok(record)
    }

    async fn delete(&self, collection: &str, id: RecordId) -> SyncResult<()> {
        let stalled = {
            let mut inner = self.store.lock();
            Self::ensure_online(&inner)?;
            match Self::take_fault(&mut inner, collection) {
                Some(Fault::Stall) => true,
                Some(fault) => return Err(fault.into_error("delete")),
                None => {
                    let existing = inner
                        .collections
                        .get(collection)
                        .and_then(|records| records.get(&id))
                        .cloned()
                        .ok_or_else(|| SyncError::NotFound(format!("{collection}/{id}")))?;
                    if !existing.is_owned_by(&self.user) {
                        return Err(SyncError::Authorization(format!(
                            "only the owner may delete {id}"
                        )));
                    }
                    if let Some(records) = inner.collections.get_mut(collection) {
                        records.remove(&id);
                    }
                    inner.writes += 1;
                    inner.publish(collection, Some(&existing), None);
                    false
                }
            }
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}
