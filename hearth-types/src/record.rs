//! The generic record envelope shared by every synchronized entity.
//!
//! A record carries a fixed envelope (`id`, `owner_id`, `shared_with`,
//! `updated_at`) and a typed payload. The remote store only ever sees the
//! raw form, `Record<serde_json::Value>`; typed views are produced at the
//! edges with [`Record::into_raw`] and [`RawRecord::decode`].

use crate::{Error, HybridTimestamp, RecordId, Result, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A payload type that can be stored in a record.
pub trait RecordPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the remote collection holding records of this type.
    const COLLECTION: &'static str;
}

/// A shareable domain entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<P> {
    pub id: RecordId,
    /// Creator of the record. Immutable after creation.
    pub owner_id: UserId,
    /// Collaborators granted read/write access.
    #[serde(default)]
    pub shared_with: BTreeSet<UserId>,
    /// Last modification time, assigned by the remote store.
    pub updated_at: HybridTimestamp,
    pub payload: P,
}

/// The untyped wire form of a record.
pub type RawRecord = Record<serde_json::Value>;

impl<P> Record<P> {
    /// Creates a new record owned by `owner_id` with no collaborators.
    pub fn new(owner_id: UserId, payload: P) -> Self {
        Self {
            id: RecordId::new(),
            owner_id,
            shared_with: BTreeSet::new(),
            updated_at: HybridTimestamp::now(),
            payload,
        }
    }

    /// Sets an explicit record id.
    #[must_use]
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    /// Adds a collaborator.
    #[must_use]
    pub fn shared_with(mut self, user: UserId) -> Self {
        self.shared_with.insert(user);
        self
    }

    /// Returns true if `user` may see this record: they own it or it is
    /// shared with them.
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        &self.owner_id == user || self.shared_with.contains(user)
    }

    /// Returns true if `user` may modify this record.
    pub fn is_writable_by(&self, user: &UserId) -> bool {
        self.is_visible_to(user)
    }

    /// Returns true if `user` may delete this record or change its owner.
    pub fn is_owned_by(&self, user: &UserId) -> bool {
        &self.owner_id == user
    }

    /// Last-write-wins ordering: the later `updated_at` wins, ties broken by
    /// lexicographic id.
    pub fn lww_cmp<Q>(&self, other: &Record<Q>) -> Ordering {
        self.updated_at
            .cmp(&other.updated_at)
            .then_with(|| self.id.to_string().cmp(&other.id.to_string()))
    }

    /// Returns true if `self` should replace `other` under last-write-wins.
    /// An identical version does not supersede, so re-applying the same copy
    /// is a no-op.
    pub fn supersedes<Q>(&self, other: &Record<Q>) -> bool {
        self.lww_cmp(other) == Ordering::Greater
    }
}

impl<P: Serialize> Record<P> {
    /// Converts a typed record into its raw wire form.
    pub fn into_raw(self) -> Result<RawRecord> {
        Ok(Record {
            id: self.id,
            owner_id: self.owner_id,
            shared_with: self.shared_with,
            updated_at: self.updated_at,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

impl RawRecord {
    /// Decodes the payload into a typed record.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<Record<P>> {
        let payload = serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::MalformedPayload(format!("record {}: {e}", self.id)))?;
        Ok(Record {
            id: self.id,
            owner_id: self.owner_id.clone(),
            shared_with: self.shared_with.clone(),
            updated_at: self.updated_at,
            payload,
        })
    }

    /// Checks envelope invariants of a record received from outside.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.as_str().trim().is_empty() {
            return Err(Error::EmptyIdentity);
        }
        Ok(())
    }
}

/// Resolves two concurrent versions of the same record: the later
/// `updated_at` wins, ties broken by lexicographic id. Deterministic and
/// independent of argument order.
pub fn resolve_conflict<'a, P>(a: &'a Record<P>, b: &'a Record<P>) -> &'a Record<P> {
    if b.lww_cmp(a) == Ordering::Greater { b } else { a }
}
