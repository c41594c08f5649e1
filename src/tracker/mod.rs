//! Session aggregates and the append-only error log.
//!
//! One session is opened per orchestrator run and shared by all of its
//! workers. Aggregates are updated atomically under concurrent increments and
//! frozen once the session is closed.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ErrorDetail, ErrorRecord, Session};

pub use memory::MemoryTracker;
pub use sqlite::SqliteTracker;

/// Trait for session and error-log backends.
#[async_trait]
pub trait SessionTracker: Send + Sync {
    /// Create a session and return its handle.
    async fn open_session(&self) -> Result<String>;

    /// Fold one attempt into the session aggregates.
    async fn record_attempt(
        &self,
        session_id: &str,
        success: bool,
        latency_ms: u64,
        bytes: u64,
    ) -> Result<()>;

    /// Append an error record. Earlier records are never touched.
    async fn record_error(&self, session_id: &str, item_id: &str, error: &ErrorDetail)
    -> Result<()>;

    /// Set `ended_at` and freeze the aggregates. Closing twice is harmless.
    async fn close_session(&self, session_id: &str) -> Result<Session>;

    async fn session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Most recent error records first, optionally scoped to one session.
    async fn recent_errors(&self, session_id: Option<&str>, limit: usize)
    -> Result<Vec<ErrorRecord>>;

    async fn error_count(&self, session_id: &str) -> Result<usize>;
}
