//! Offline-first sync engine for Hearth.
//!
//! Keeps a household's records (meal and sleep logs, recipes, custom and
//! shopping items, child profiles) in sync with a hosted document store,
//! and shares record libraries between collaborating parents.
//!
//! # Architecture
//!
//! Writes never go straight to the backend. They are appended to a durable
//! mutation log and applied by a single drain task, so a write made offline
//! survives a restart and lands once connectivity returns. Reads are live
//! subscriptions that merge the records a user owns with the records shared
//! with them, resolving duplicates with last-write-wins.
//!
//! ## Components
//!
//! - **Retry**: exponential backoff with jitter, per-attempt timeouts and an
//!   attempt ceiling, used by every remote call
//! - **Reachability**: debounced online/offline signal
//! - **Queue**: durable FIFO of pending mutations with per-record ordering
//! - **Channel**: merged owned/shared live subscriptions with reconnects
//! - **Status**: per-operation progress for the UI
//! - **Sharing**: collaboration accept/decline/revoke and library propagation
//! - **Engine**: wires everything together for one signed-in user
//!
//! # Example
//!
//! ```no_run
//! use hearth_sync::{MemoryMutationLog, MemoryRemoteStore, PendingMutation, SyncConfig, SyncEngine};
//! use hearth_types::{Recipe, Record, UserId};
//! use std::sync::Arc;
//!
//! # async fn run() -> hearth_sync::SyncResult<()> {
//! let user = UserId::new("alice").expect("valid user");
//! let backend = MemoryRemoteStore::new();
//! let engine = SyncEngine::init(
//!     user.clone(),
//!     SyncConfig::default(),
//!     Arc::new(backend.session(user.clone())),
//!     Arc::new(MemoryMutationLog::new()),
//! )
//! .await?;
//!
//! let recipe = Record::new(user, Recipe::titled("Porridge"));
//! engine.enqueue_mutation(PendingMutation::create(recipe)?).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
mod engine;
mod error;
pub mod merge;
pub mod queue;
pub mod reachability;
pub mod remote;
pub mod retry;
pub mod sharing;
pub mod status;

pub use channel::{ChannelHealth, RecordSyncChannel, SortOrder, Subscription};
pub use config::{
    ChannelConfig, QueueConfig, ReachabilityConfig, RetryConfig, SharingConfig, StatusConfig,
    SyncConfig,
};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use merge::{MergedView, Side};
pub use queue::{
    DrainReport, MemoryMutationLog, MutationKind, MutationLog, OfflineMutationQueue,
    PendingMutation, SqliteMutationLog,
};
pub use reachability::{NetworkReachabilityMonitor, ReachabilityEvent};
pub use remote::{
    Fault, MemoryRemoteStore, MemorySession, Query, RecordEvent, RecordStream, RemoteStore,
};
pub use retry::RetryPolicy;
pub use sharing::{PropagationReport, RecordSet, SharingCoordinator};
pub use status::{SyncState, SyncStatusEntry, SyncStatusRegistry};
