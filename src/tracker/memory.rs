//! In-memory session tracker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::models::{ErrorDetail, ErrorRecord, Session};
use crate::tracker::SessionTracker;

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    errors: Vec<ErrorRecord>,
}

/// Mutex-guarded tracker for tests and embedding.
#[derive(Default)]
pub struct MemoryTracker {
    state: Mutex<State>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| HarvestError::storage("memory tracker mutex poisoned"))
    }

    /// Every error record, oldest first.
    pub fn all_errors(&self) -> Result<Vec<ErrorRecord>> {
        Ok(self.lock()?.errors.clone())
    }
}

#[async_trait]
impl SessionTracker for MemoryTracker {
    async fn open_session(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        let session = Session::new(session_id.clone(), Utc::now());
        self.lock()?.sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    async fn record_attempt(
        &self,
        session_id: &str,
        success: bool,
        latency_ms: u64,
        bytes: u64,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| HarvestError::SessionNotFound(session_id.to_string()))?;
        if session.is_closed() {
            return Err(HarvestError::SessionClosed(session_id.to_string()));
        }
        session.apply_attempt(success, latency_ms, bytes);
        Ok(())
    }

    async fn record_error(
        &self,
        session_id: &str,
        item_id: &str,
        error: &ErrorDetail,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if !state.sessions.contains_key(session_id) {
            return Err(HarvestError::SessionNotFound(session_id.to_string()));
        }
        state
            .errors
            .push(ErrorRecord::new(session_id, item_id, error));
        Ok(())
    }

    async fn close_session(&self, session_id: &str) -> Result<Session> {
        let mut state = self.lock()?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| HarvestError::SessionNotFound(session_id.to_string()))?;
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
        Ok(session.clone())
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(session_id).cloned())
    }

    async fn recent_errors(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ErrorRecord>> {
        let state = self.lock()?;
        Ok(state
            .errors
            .iter()
            .rev()
            .filter(|e| session_id.is_none_or(|s| e.session_id == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn error_count(&self, session_id: &str) -> Result<usize> {
        let state = self.lock()?;
        Ok(state
            .errors
            .iter()
            .filter(|e| e.session_id == session_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorClass;
    use std::sync::Arc;

    fn detail(attempt: u32) -> ErrorDetail {
        ErrorDetail {
            class: ErrorClass::Transient,
            code: "ECONNRESET".into(),
            message: "connection reset".into(),
            retry_attempt: attempt,
        }
    }

    #[tokio::test]
    async fn test_concurrent_attempts_are_all_counted() {
        let tracker = Arc::new(MemoryTracker::new());
        let sid = tracker.open_session().await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let tracker = Arc::clone(&tracker);
            let sid = sid.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    tracker
                        .record_attempt(&sid, worker % 2 == 0, 10, 100)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let session = tracker.session(&sid).await.unwrap().unwrap();
        assert_eq!(session.attempted, 200);
        assert_eq!(session.succeeded, 100);
        assert_eq!(session.failed, 100);
        assert_eq!(session.total_bytes, 20_000);
    }

    #[tokio::test]
    async fn test_error_log_is_append_only() {
        let tracker = MemoryTracker::new();
        let sid = tracker.open_session().await.unwrap();
        tracker.record_error(&sid, "a", &detail(1)).await.unwrap();
        tracker.record_error(&sid, "a", &detail(2)).await.unwrap();

        assert_eq!(tracker.error_count(&sid).await.unwrap(), 2);
        let recent = tracker.recent_errors(Some(&sid), 10).await.unwrap();
        assert_eq!(recent[0].retry_attempt, 2);
        assert_eq!(recent[1].retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_close_freezes_aggregates() {
        let tracker = MemoryTracker::new();
        let sid = tracker.open_session().await.unwrap();
        tracker.record_attempt(&sid, true, 5, 5).await.unwrap();

        let closed = tracker.close_session(&sid).await.unwrap();
        assert!(closed.ended_at.is_some());
        assert!(matches!(
            tracker.record_attempt(&sid, true, 5, 5).await,
            Err(HarvestError::SessionClosed(_))
        ));

        let again = tracker.close_session(&sid).await.unwrap();
        assert_eq!(again.ended_at, closed.ended_at);
        assert_eq!(again.attempted, 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let tracker = MemoryTracker::new();
        assert!(matches!(
            tracker.record_attempt("nope", true, 0, 0).await,
            Err(HarvestError::SessionNotFound(_))
        ));
        assert!(tracker.session("nope").await.unwrap().is_none());
    }
}
