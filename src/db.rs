// src/db.rs

//! Shared SQLite database for the ledger and the session tracker.
//!
//! Each operation opens its own connection with a busy timeout and runs on
//! the blocking pool, so several workers (or several processes pointed at the
//! same file) contend only through SQLite's own locking.
//!
//! ## Tables
//!
//! ```text
//! work_items      # one row per unit of work, status column drives the lifecycle
//! sessions        # one row per engine run, aggregates updated in place
//! error_records   # append-only per-item failures
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;

use crate::error::Result;

/// Handle to a SQLite database file.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let db = Self {
            path: path.into(),
            busy_timeout,
        };
        if let Some(parent) = db.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Run `f` with its own connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.connect()?;
            f(&mut conn)
        })
        .await?
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL UNIQUE,
                partition_key TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                source_locator TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',

                -- Retry tracking
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                last_error_code TEXT,
                last_error_message TEXT,

                -- Timing (unix millis)
                created_at INTEGER NOT NULL,
                claimed_at INTEGER,
                completed_at INTEGER,

                -- Result metrics
                latency_ms INTEGER,
                size_bytes INTEGER,

                CHECK (status IN ('pending', 'claimed', 'completed', 'failed', 'invalid')),
                CHECK (status <> 'claimed' OR claimed_at IS NOT NULL)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                attempted INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                total_latency_ms INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS error_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(session_id),
                item_id TEXT NOT NULL,
                error_class TEXT NOT NULL,
                error_code TEXT NOT NULL,
                message TEXT NOT NULL,
                retry_attempt INTEGER NOT NULL,
                occurred_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_claim
                ON work_items(status, priority DESC, seq);
            CREATE INDEX IF NOT EXISTS idx_work_items_partition
                ON work_items(partition_key, status);
            CREATE INDEX IF NOT EXISTS idx_work_items_stale
                ON work_items(claimed_at) WHERE status = 'claimed';
            CREATE INDEX IF NOT EXISTS idx_error_records_session
                ON error_records(session_id, id);
            CREATE INDEX IF NOT EXISTS idx_error_records_item
                ON error_records(item_id);
        "#,
        )?;
        Ok(())
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Decode a unix-millis column.
pub(crate) fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {ms} out of range").into(),
        )
    })
}

pub(crate) fn from_millis_opt(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(idx, ms)).transpose()
}

/// Decode a text column through `FromStr`.
pub(crate) fn parse_text<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_and_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/harvest.db");
        let db = Database::open(&path, Duration::from_secs(1)).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());

        let conn = db.connect().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('work_items', 'sessions', 'error_records')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_open_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvest.db");
        Database::open(&path, Duration::from_secs(1)).unwrap();
        Database::open(&path, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_millis_round_trip() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(0, to_millis(now)).unwrap(), now);
        assert!(from_millis(0, i64::MAX).is_err());
    }
}
