//! SQLite session tracker.
//!
//! Aggregates are bumped with a single `UPDATE … SET attempted = attempted + 1`
//! so concurrent workers never lose increments.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use crate::db::{Database, from_millis, from_millis_opt, parse_text, to_millis};
use crate::error::{HarvestError, Result};
use crate::models::{ErrorDetail, ErrorRecord, Session};
use crate::tracker::SessionTracker;

const SESSION_COLUMNS: &str =
    "session_id, started_at, ended_at, attempted, succeeded, failed, total_latency_ms, total_bytes";

const ERROR_COLUMNS: &str =
    "session_id, item_id, error_class, error_code, message, retry_attempt, occurred_at";

/// SQLite-backed session tracker sharing the ledger's database.
#[derive(Debug, Clone)]
pub struct SqliteTracker {
    db: Database,
}

impl SqliteTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let attempted: i64 = row.get(3)?;
    let total_latency_ms: i64 = row.get(6)?;
    let avg_latency_ms = if attempted > 0 {
        total_latency_ms as f64 / attempted as f64
    } else {
        0.0
    };

    Ok(Session {
        session_id: row.get(0)?,
        started_at: from_millis(1, row.get(1)?)?,
        ended_at: from_millis_opt(2, row.get(2)?)?,
        attempted: attempted.max(0) as u64,
        succeeded: row.get::<_, i64>(4)?.max(0) as u64,
        failed: row.get::<_, i64>(5)?.max(0) as u64,
        avg_latency_ms,
        total_bytes: row.get::<_, i64>(7)?.max(0) as u64,
    })
}

fn row_to_error(row: &Row<'_>) -> rusqlite::Result<ErrorRecord> {
    let class: String = row.get(2)?;
    Ok(ErrorRecord {
        session_id: row.get(0)?,
        item_id: row.get(1)?,
        error_class: parse_text(2, &class)?,
        error_code: row.get(3)?,
        message: row.get(4)?,
        retry_attempt: row.get(5)?,
        occurred_at: from_millis(6, row.get(6)?)?,
    })
}

/// Whether a session row exists and is closed. `None` when it does not exist.
fn session_closed(conn: &rusqlite::Connection, session_id: &str) -> Result<Option<bool>> {
    let ended_at: Option<Option<i64>> = conn
        .query_row(
            "SELECT ended_at FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ended_at.map(|ended| ended.is_some()))
}

#[async_trait]
impl SessionTracker for SqliteTracker {
    async fn open_session(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let id = session_id.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (session_id, started_at) VALUES (?1, ?2)",
                    params![id, to_millis(Utc::now())],
                )?;
                Ok(())
            })
            .await?;
        Ok(session_id)
    }

    async fn record_attempt(
        &self,
        session_id: &str,
        success: bool,
        latency_ms: u64,
        bytes: u64,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE sessions
                     SET attempted = attempted + 1,
                         succeeded = succeeded + ?2,
                         failed = failed + ?3,
                         total_latency_ms = total_latency_ms + ?4,
                         total_bytes = total_bytes + ?5
                     WHERE session_id = ?1 AND ended_at IS NULL",
                    params![
                        session_id,
                        i64::from(success),
                        i64::from(!success),
                        i64::try_from(latency_ms).unwrap_or(i64::MAX),
                        i64::try_from(bytes).unwrap_or(i64::MAX),
                    ],
                )?;
                if updated == 1 {
                    return Ok(());
                }
                match session_closed(conn, &session_id)? {
                    Some(_) => Err(HarvestError::SessionClosed(session_id)),
                    None => Err(HarvestError::SessionNotFound(session_id)),
                }
            })
            .await
    }

    async fn record_error(
        &self,
        session_id: &str,
        item_id: &str,
        error: &ErrorDetail,
    ) -> Result<()> {
        let record = ErrorRecord::new(session_id, item_id, error);
        self.db
            .call(move |conn| {
                if session_closed(conn, &record.session_id)?.is_none() {
                    return Err(HarvestError::SessionNotFound(record.session_id));
                }
                conn.execute(
                    "INSERT INTO error_records
                        (session_id, item_id, error_class, error_code, message,
                         retry_attempt, occurred_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.session_id,
                        record.item_id,
                        record.error_class.as_str(),
                        record.error_code,
                        record.message,
                        record.retry_attempt,
                        to_millis(record.occurred_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn close_session(&self, session_id: &str) -> Result<Session> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET ended_at = ?2
                     WHERE session_id = ?1 AND ended_at IS NULL",
                    params![session_id, to_millis(Utc::now())],
                )?;
                conn.query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                    params![session_id],
                    row_to_session,
                )
                .optional()?
                .ok_or_else(|| HarvestError::SessionNotFound(session_id.clone()))
            })
            .await
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                        params![session_id],
                        row_to_session,
                    )
                    .optional()?)
            })
            .await
    }

    async fn recent_errors(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>> {
        let session_id = session_id.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ERROR_COLUMNS} FROM error_records
                     WHERE (?1 IS NULL OR session_id = ?1)
                     ORDER BY id DESC
                     LIMIT ?2"
                ))?;
                let records = stmt
                    .query_map(params![session_id, limit], row_to_error)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
    }

    async fn error_count(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM error_records WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )?;
                Ok(count.max(0) as usize)
            })
            .await
    }
}
