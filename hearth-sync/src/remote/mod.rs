//! Remote document store abstraction.
//!
//! The sync engine talks to the backend only through [`RemoteStore`]: live
//! queries, one-shot reads, writes and deletes of raw records. Each
//! implementation is bound to one authenticated user session.

pub mod memory;

use crate::error::SyncResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use hearth_types::{RawRecord, RecordId, UserId};

pub use memory::{Fault, MemoryRemoteStore, MemorySession};

/// The two queries that make up a user's view of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// Records where `owner_id == user`.
    OwnedBy(UserId),
    /// Records where `shared_with` contains the user.
    SharedWith(UserId),
}

impl Query {
    /// Returns true if `record` belongs to this query's result set.
    pub fn matches(&self, record: &RawRecord) -> bool {
        match self {
            Query::OwnedBy(user) => &record.owner_id == user,
            Query::SharedWith(user) => record.shared_with.contains(user),
        }
    }
}

/// An incremental update pushed by a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    /// The complete current result set. Replaces everything held so far.
    Snapshot(Vec<RawRecord>),
    /// A record entered the result set or changed.
    Upserted(RawRecord),
    /// A record left the result set or was deleted.
    Removed(RecordId),
}

/// A live subscription. Ends (or yields an error) when the connection drops.
pub type RecordStream = BoxStream<'static, SyncResult<RecordEvent>>;

/// Record-level access to the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Opens a live query. The first event is a snapshot of the current
    /// result set.
    async fn subscribe(&self, collection: &str, query: Query) -> SyncResult<RecordStream>;

    /// Runs a query once.
    async fn list(&self, collection: &str, query: Query) -> SyncResult<Vec<RawRecord>>;

    /// Reads a single record.
    async fn get(&self, collection: &str, id: RecordId) -> SyncResult<RawRecord>;

    /// Creates or replaces a record. Returns the stored copy carrying the
    /// server-assigned `updated_at`. Fails with `Conflict` when the stored
    /// copy is newer than `record`.
    async fn write(&self, collection: &str, record: RawRecord) -> SyncResult<RawRecord>;

    /// Deletes a record. Only the owner may delete.
    async fn delete(&self, collection: &str, id: RecordId) -> SyncResult<()>;
}
