//! `SQLite` persistence layer.

use heapsync_core::{ActionLog, Baseline, HeapError, InitialUpdate, LoggedHistory, Update};
use heapsync_proto::{decode_update, encode_update};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::Arc;

/// `SQLite`-backed store shared by every heap's log.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            r"
            -- Committed updates after the latest baseline
            CREATE TABLE IF NOT EXISTS heap_updates (
                heap_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (heap_id, seq)
            );

            -- Compacted snapshot per heap
            CREATE TABLE IF NOT EXISTS heap_baselines (
                heap_id TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                next_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Append an encoded update; returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn append_update(&self, heap_id: &str, payload: &[u8]) -> SqliteResult<u64> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM heap_updates WHERE heap_id = ?1",
            [heap_id],
            |row| row.get(0),
        )?;

        self.conn.execute(
            r"
            INSERT INTO heap_updates (heap_id, seq, payload, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (heap_id, seq, payload, chrono::Utc::now().timestamp()),
        )?;

        to_u64(seq)
    }

    /// Encoded updates for a heap, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn updates(&self, heap_id: &str) -> SqliteResult<Vec<Vec<u8>>> {
        let mut stmt = self.conn.prepare(
            r"
            SELECT payload FROM heap_updates
            WHERE heap_id = ?1
            ORDER BY seq ASC
            ",
        )?;

        let updates = stmt
            .query_map([heap_id], |row| row.get(0))?
            .collect::<SqliteResult<Vec<Vec<u8>>>>()?;

        Ok(updates)
    }

    /// Latest baseline payload and allocator position for a heap.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn baseline(&self, heap_id: &str) -> SqliteResult<Option<(Vec<u8>, u64)>> {
        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT payload, next_id FROM heap_baselines WHERE heap_id = ?1",
                [heap_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(payload, next_id)| to_u64(next_id).map(|next_id| (payload, next_id)))
            .transpose()
    }

    /// Replace a heap's baseline and delete the updates it covers, in one
    /// transaction. Returns the number of deleted updates.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub fn compact(&mut self, heap_id: &str, payload: &[u8], next_id: u64) -> SqliteResult<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r"
            INSERT OR REPLACE INTO heap_baselines (heap_id, payload, next_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (heap_id, payload, to_i64(next_id)?, chrono::Utc::now().timestamp()),
        )?;
        let deleted = tx.execute("DELETE FROM heap_updates WHERE heap_id = ?1", [heap_id])?;
        tx.commit()?;
        Ok(deleted)
    }
}

fn to_i64(value: u64) -> SqliteResult<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn to_u64(value: i64) -> SqliteResult<u64> {
    u64::try_from(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
    })
}

/// One heap's [`ActionLog`] inside a shared [`SqliteStore`].
#[derive(Clone)]
pub struct SqliteActionLog {
    store: Arc<Mutex<SqliteStore>>,
    heap_id: String,
}

impl SqliteActionLog {
    /// Log for `heap_id`.
    #[must_use]
    pub fn new(store: Arc<Mutex<SqliteStore>>, heap_id: impl Into<String>) -> Self {
        Self {
            store,
            heap_id: heap_id.into(),
        }
    }
}

fn log_error(heap_id: &str, err: impl std::fmt::Display) -> HeapError {
    HeapError::Log(format!("heap {heap_id}: {err}"))
}

impl ActionLog for SqliteActionLog {
    fn append(&mut self, update: &Update) -> Result<(), HeapError> {
        let payload = encode_update(update, false).map_err(|e| log_error(&self.heap_id, e))?;
        let seq = self
            .store
            .lock()
            .append_update(&self.heap_id, &payload)
            .map_err(|e| log_error(&self.heap_id, e))?;
        tracing::trace!(heap_id = %self.heap_id, seq, bytes = payload.len(), "Logged update");
        Ok(())
    }

    fn compact(&mut self, baseline: &Baseline) -> Result<(), HeapError> {
        let payload = encode_update(baseline.initial.as_update(), false)
            .map_err(|e| log_error(&self.heap_id, e))?;
        let deleted = self
            .store
            .lock()
            .compact(&self.heap_id, &payload, baseline.next_id)
            .map_err(|e| log_error(&self.heap_id, e))?;
        tracing::debug!(heap_id = %self.heap_id, deleted, "Compacted heap log");
        Ok(())
    }

    fn load(&mut self) -> Result<LoggedHistory, HeapError> {
        let store = self.store.lock();
        let baseline = store
            .baseline(&self.heap_id)
            .map_err(|e| log_error(&self.heap_id, e))?
            .map(|(payload, next_id)| {
                decode_update(&payload, true).map(|update| Baseline {
                    initial: InitialUpdate::from_update(update),
                    next_id,
                })
            })
            .transpose()
            .map_err(|e| log_error(&self.heap_id, e))?;

        let updates = store
            .updates(&self.heap_id)
            .map_err(|e| log_error(&self.heap_id, e))?
            .iter()
            .map(|payload| decode_update(payload, true))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| log_error(&self.heap_id, e))?;

        Ok(LoggedHistory { baseline, updates })
    }
}
