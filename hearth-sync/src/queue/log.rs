//! Durable storage for queued mutations.
//!
//! The log holds opaque entries keyed by operation id, in append order.
//! Producers only append; the drain loop is the single writer allowed to
//! rewrite or remove entries.

use crate::error::{SyncError, SyncResult};
use hearth_types::OperationId;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex};

/// One persisted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub operation_id: OperationId,
    pub bytes: Vec<u8>,
}

/// Key-value persistence for the offline queue.
pub trait MutationLog: Send + Sync {
    /// Appends an entry. Must be durable when this returns.
    fn append(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()>;

    /// Returns every entry in append order.
    fn read_all(&self) -> SyncResult<Vec<LogEntry>>;

    /// Replaces an entry in place, keeping its position.
    fn update(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()>;

    /// Removes an entry. Removing an unknown id is not an error.
    fn remove(&self, operation_id: OperationId) -> SyncResult<()>;
}

/// Log kept in memory. Clones share the same entries, so a clone handed to
/// a fresh queue behaves like storage that survived a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryMutationLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryMutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Vec<LogEntry>>> {
        self.entries
            .lock()
            .map_err(|_| SyncError::Storage("mutation log lock poisoned".into()))
    }
}

impl MutationLog for MemoryMutationLog {
    fn append(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()> {
        self.lock()?.push(LogEntry {
            operation_id,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn read_all(&self) -> SyncResult<Vec<LogEntry>> {
        Ok(self.lock()?.clone())
    }

    fn update(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.operation_id == operation_id)
            .ok_or_else(|| SyncError::NotFound(format!("queue entry {operation_id}")))?;
        entry.bytes = bytes.to_vec();
        Ok(())
    }

    fn remove(&self, operation_id: OperationId) -> SyncResult<()> {
        self.lock()?.retain(|e| e.operation_id != operation_id);
        Ok(())
    }
}

/// Log backed by a SQLite file.
pub struct SqliteMutationLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMutationLog {
    /// Opens (or creates) a log at the given path.
    pub fn new(path: &str) -> SyncResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| SyncError::Storage(format!("failed to open mutation log: {e}")))?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory log (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::Storage(format!("failed to open in-memory mutation log: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> SyncResult<Self> {
        conn.execute_batch(
            "
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS mutation_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL UNIQUE,
                body BLOB NOT NULL
            );
            ",
        )
        .map_err(|e| SyncError::Storage(format!("failed to init mutation log schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("mutation log lock poisoned".into()))
    }
}

impl MutationLog for SqliteMutationLog {
    fn append(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO mutation_log (operation_id, body) VALUES (?1, ?2)",
            params![operation_id.to_string(), bytes],
        )
        .map_err(|e| SyncError::Storage(format!("failed to append mutation: {e}")))?;
        Ok(())
    }

    fn read_all(&self) -> SyncResult<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT operation_id, body FROM mutation_log ORDER BY seq ASC")
            .map_err(|e| SyncError::Storage(format!("failed to prepare log query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let body: Vec<u8> = row.get(1)?;
                Ok((id, body))
            })
            .map_err(|e| SyncError::Storage(format!("failed to read mutation log: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, bytes) =
                row.map_err(|e| SyncError::Storage(format!("failed to read log row: {e}")))?;
            let operation_id = OperationId::parse(&id)
                .map_err(|e| SyncError::Storage(format!("invalid operation id in log: {e}")))?;
            entries.push(LogEntry {
                operation_id,
                bytes,
            });
        }
        Ok(entries)
    }

    fn update(&self, operation_id: OperationId, bytes: &[u8]) -> SyncResult<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE mutation_log SET body = ?2 WHERE operation_id = ?1",
                params![operation_id.to_string(), bytes],
            )
            .map_err(|e| SyncError::Storage(format!("failed to update mutation: {e}")))?;
        if changed == 0 {
            return Err(SyncError::NotFound(format!("queue entry {operation_id}")));
        }
        Ok(())
    }

    fn remove(&self, operation_id: OperationId) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM mutation_log WHERE operation_id = ?1",
            params![operation_id.to_string()],
        )
        .map_err(|e| SyncError::Storage(format!("failed to remove mutation: {e}")))?;
        Ok(())
    }
}

impl SqliteMutationLog {
    /// Returns true if an entry for `operation_id` is stored.
    pub fn contains(&self, operation_id: OperationId) -> SyncResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT seq FROM mutation_log WHERE operation_id = ?1",
                params![operation_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("failed to query mutation log: {e}")))?;
        Ok(found.is_some())
    }
}
