//! Durable storage for not-yet-delivered records.
//!
//! A record exists in the store exactly as long as it has not been
//! confirmed delivered. Inserts upsert by id; each upsert bumps the
//! record's revision so a flush can delete precisely what it sent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use telesync_core::PendingRecord;

use crate::error::StoreError;

/// Persistence seam for the outbound queue.
///
/// Implementations must be safe to call from several tasks at once:
/// inserts may land at any time, including while a flush holds a batch.
pub trait DurableQueueStore: Send + Sync {
    /// Upsert by id. Returns the revision now stored for that id.
    fn insert(&self, record: &PendingRecord) -> Result<u64, StoreError>;

    /// Up to `limit` records, priority ascending, ties by first insertion.
    fn load_oldest(&self, limit: usize) -> Result<Vec<PendingRecord>, StoreError>;

    /// Remove the records with these ids, whatever their revision.
    fn delete(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Remove each record only if it still has the given revision.
    fn delete_exact(&self, keys: &[(String, u64)]) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

// ─── SQLite ───────────────────────────────────────────────────────

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS pending_records (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                payload     TEXT NOT NULL,
                priority    INTEGER NOT NULL DEFAULT 0,
                revision    INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS pending_records_order
                ON pending_records (priority, seq);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Look up one record by id.
    pub fn get(&self, id: &str) -> Result<Option<PendingRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, payload, priority, revision FROM pending_records WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRecord> {
    let revision: i64 = row.get(3)?;
    Ok(PendingRecord {
        id: row.get(0)?,
        payload: row.get(1)?,
        priority: row.get(2)?,
        revision: revision.max(0) as u64,
    })
}

impl DurableQueueStore for SqliteQueueStore {
    fn insert(&self, record: &PendingRecord) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        // The original `seq` survives an upsert, so a replaced record keeps
        // its place in the insertion order.
        let revision: i64 = conn.query_row(
            "INSERT INTO pending_records (id, payload, priority, revision, enqueued_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                payload    = excluded.payload,
                priority   = excluded.priority,
                revision   = pending_records.revision + 1,
                updated_at = excluded.updated_at
             RETURNING revision",
            params![record.id, record.payload, record.priority, now],
            |row| row.get(0),
        )?;
        Ok(revision.max(0) as u64)
    }

    fn load_oldest(&self, limit: usize) -> Result<Vec<PendingRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload, priority, revision FROM pending_records
             ORDER BY priority ASC, seq ASC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM pending_records WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn delete_exact(&self, keys: &[(String, u64)]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt =
                tx.prepare("DELETE FROM pending_records WHERE id = ?1 AND revision = ?2")?;
            for (id, revision) in keys {
                let revision = i64::try_from(*revision).unwrap_or(i64::MAX);
                removed += stmt.execute(params![id, revision])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_records", [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as usize)
    }
}

// ─── In-memory ────────────────────────────────────────────────────

#[derive(Debug)]
struct MemoryEntry {
    record: PendingRecord,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_seq: u64,
    entries: HashMap<String, MemoryEntry>,
}

/// Volatile store with the same ordering and upsert rules as SQLite.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl DurableQueueStore for MemoryQueueStore {
    fn insert(&self, record: &PendingRecord) -> Result<u64, StoreError> {
        let mut inner = self.inner()?;
        if let Some(entry) = inner.entries.get_mut(&record.id) {
            entry.record.payload = record.payload.clone();
            entry.record.priority = record.priority;
            entry.record.revision += 1;
            return Ok(entry.record.revision);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut stored = record.clone();
        stored.revision = 0;
        inner
            .entries
            .insert(record.id.clone(), MemoryEntry { record: stored, seq });
        Ok(0)
    }

    fn load_oldest(&self, limit: usize) -> Result<Vec<PendingRecord>, StoreError> {
        let inner = self.inner()?;
        let mut entries: Vec<&MemoryEntry> = inner.entries.values().collect();
        entries.sort_by_key(|e| (e.record.priority, e.seq));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.inner()?;
        Ok(ids
            .iter()
            .filter(|id| inner.entries.remove(id.as_str()).is_some())
            .count())
    }

    fn delete_exact(&self, keys: &[(String, u64)]) -> Result<usize, StoreError> {
        let mut inner = self.inner()?;
        let mut removed = 0;
        for (id, revision) in keys {
            if inner
                .entries
                .get(id)
                .is_some_and(|e| e.record.revision == *revision)
            {
                inner.entries.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.inner()?.entries.len())
    }
}
