//! Work ledger abstractions.
//!
//! The ledger is the single source of truth for item ownership. Every
//! operation is one atomic unit: callers never observe an item halfway
//! between two statuses, and two concurrent `claim_batch` calls never
//! receive the same item.
//!
//! ## Backends
//!
//! ```text
//! MemoryLedger   # mutex-guarded map, for tests and embedding
//! SqliteLedger   # BEGIN IMMEDIATE transactions on a shared database file
//! ```

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ItemError, LedgerStats, NewWorkItem, Transition, WorkItem};

// Re-export for convenience
pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Trait for durable work queues.
#[async_trait]
pub trait WorkLedger: Send + Sync {
    /// Insert new Pending items. Existing ids are left untouched.
    ///
    /// Returns how many items were actually inserted.
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<usize>;

    /// Atomically claim up to `limit` Pending items.
    ///
    /// Items are returned priority descending, then in insertion order.
    async fn claim_batch(&self, limit: usize, partition: Option<&str>) -> Result<Vec<WorkItem>>;

    /// Claimed → Completed. A repeat call is a no-op.
    async fn mark_completed(
        &self,
        item_id: &str,
        latency_ms: u64,
        size_bytes: u64,
    ) -> Result<Transition>;

    /// Claimed → Pending while retries remain, else Claimed → Failed.
    async fn mark_failed(&self, item_id: &str, error: &ItemError) -> Result<Transition>;

    /// Claimed → Invalid. Never retried.
    async fn mark_invalid(&self, item_id: &str, reason: &str) -> Result<Transition>;

    /// Claimed → Pending without retry penalty, for items never started.
    async fn release(&self, item_ids: &[String]) -> Result<usize>;

    /// Return Claimed items whose claim is at least `older_than` old to Pending.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize>;

    /// Counts per status, globally and per partition.
    async fn stats(&self) -> Result<LedgerStats>;

    /// Look up one item.
    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>>;
}

/// Outcome of `mark_failed` for an item that has `retry_count` retries used.
///
/// Returns the new retry count and whether the item goes back to Pending.
pub(crate) fn next_retry(retry_count: u32, max_retries: u32) -> (u32, bool) {
    let next = retry_count.saturating_add(1);
    (next, next <= max_retries)
}

/// Claims made at or before the returned instant are stale.
///
/// `None` when `older_than` reaches past the representable range, in which
/// case no claim can be that old.
pub(crate) fn stale_cutoff(older_than: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(older_than).ok()?;
    Utc::now().checked_sub_signed(age)
}
