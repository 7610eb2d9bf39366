//! Core type definitions for Hearth sync.
//!
//! This crate defines the storage-agnostic types shared by the sync engine
//! and the app:
//! - Record, operation, profile and user identifiers
//! - Hybrid Logical Clock timestamps used for last-write-wins
//! - The generic `Record<P>` envelope and the household record kinds
//! - Collaboration invitations and their state machine

mod collaboration;
mod ids;
pub mod kinds;
mod record;
mod timestamp;

pub use collaboration::{Collaboration, CollaborationStatus};
pub use ids::{OperationId, ProfileId, RecordId, UserId};
pub use kinds::{ChildProfile, CustomItem, MealLog, Recipe, ShoppingItem, SleepLog};
pub use record::{RawRecord, Record, RecordPayload, resolve_conflict};
pub use timestamp::HybridTimestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid collaboration transition: {from} -> {to}")]
    InvalidTransition {
        from: CollaborationStatus,
        to: CollaborationStatus,
    },
}
