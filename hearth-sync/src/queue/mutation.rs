//! Pending mutations and their persisted form.
//!
//! Each log entry is a small JSON envelope `{ "version": N, "mutation": {...} }`.
//! Fields added later must carry serde defaults so older entries keep
//! decoding; an entry written by a newer major format is left untouched
//! rather than guessed at.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use hearth_types::{HybridTimestamp, OperationId, RawRecord, Record, RecordId, RecordPayload};
use serde::{Deserialize, Serialize};

/// Current persisted format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A write waiting to be confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub operation_id: OperationId,
    /// Remote collection the record lives in.
    pub record_type: String,
    pub record_id: RecordId,
    pub kind: MutationKind,
    /// The full raw record for creates and updates, `null` for deletes.
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Set once the mutation failed terminally and awaits retry or discard.
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMutation {
    /// A create of a new typed record.
    pub fn create<P: RecordPayload>(record: Record<P>) -> SyncResult<Self> {
        Self::upsert(P::COLLECTION, MutationKind::Create, record.into_raw()?)
    }

    /// An update of an existing typed record. The record is stamped with the
    /// current time so last-write-wins orders it against remote edits.
    pub fn update<P: RecordPayload>(mut record: Record<P>) -> SyncResult<Self> {
        record.updated_at = HybridTimestamp::now();
        Self::upsert(P::COLLECTION, MutationKind::Update, record.into_raw()?)
    }

    /// A delete of a typed record.
    pub fn delete<P: RecordPayload>(record_id: RecordId) -> Self {
        Self::delete_raw(P::COLLECTION, record_id)
    }

    /// A create or update of a raw record in `collection`.
    pub fn upsert(collection: &str, kind: MutationKind, record: RawRecord) -> SyncResult<Self> {
        if kind == MutationKind::Delete {
            return Ok(Self::delete_raw(collection, record.id));
        }
        Ok(Self {
            operation_id: OperationId::new(),
            record_type: collection.to_string(),
            record_id: record.id,
            kind,
            payload: serde_json::to_value(record)?,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            failed: false,
            last_error: None,
        })
    }

    /// A delete of a raw record in `collection`.
    pub fn delete_raw(collection: &str, record_id: RecordId) -> Self {
        Self {
            operation_id: OperationId::new(),
            record_type: collection.to_string(),
            record_id,
            kind: MutationKind::Delete,
            payload: serde_json::Value::Null,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            failed: false,
            last_error: None,
        }
    }

    /// Decodes the record carried by a create or update.
    pub fn record(&self) -> SyncResult<RawRecord> {
        let record: RawRecord = serde_json::from_value(self.payload.clone()).map_err(|e| {
            SyncError::MalformedPayload(format!("mutation {}: {e}", self.operation_id))
        })?;
        if record.id != self.record_id {
            return Err(SyncError::MalformedPayload(format!(
                "mutation {} targets {} but carries {}",
                self.operation_id, self.record_id, record.id
            )));
        }
        Ok(record)
    }

    /// Key used to keep per-record ordering.
    pub(crate) fn record_key(&self) -> (String, RecordId) {
        (self.record_type.clone(), self.record_id)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    mutation: &'a PendingMutation,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    mutation: serde_json::Value,
}

/// Result of decoding a log entry.
#[derive(Debug)]
pub enum DecodedEntry {
    Mutation(PendingMutation),
    /// Written by a newer app version.
    Unsupported { version: u32 },
}

/// Serializes a mutation for the durable log.
pub fn encode(mutation: &PendingMutation) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        version: FORMAT_VERSION,
        mutation,
    })?)
}

/// Deserializes a log entry.
pub fn decode(bytes: &[u8]) -> SyncResult<DecodedEntry> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::MalformedPayload(format!("unreadable queue entry: {e}")))?;
    if envelope.version > FORMAT_VERSION {
        return Ok(DecodedEntry::Unsupported {
            version: envelope.version,
        });
    }
    let mutation = serde_json::from_value(envelope.mutation)
        .map_err(|e| SyncError::MalformedPayload(format!("unreadable queue entry: {e}")))?;
    Ok(DecodedEntry::Mutation(mutation))
}
