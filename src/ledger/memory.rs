//! In-memory ledger implementation.
//!
//! Every operation runs inside one critical section of a single mutex, which
//! is what makes `claim_batch` an atomic read-modify-write. Nothing survives
//! the process; use [`SqliteLedger`](super::SqliteLedger) for real runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{HarvestError, Result};
use crate::ledger::{WorkLedger, next_retry, stale_cutoff};
use crate::models::{ItemError, LedgerStats, NewWorkItem, Transition, WorkItem, WorkStatus};

#[derive(Default)]
struct State {
    items: HashMap<String, Entry>,
    next_seq: u64,
}

struct Entry {
    /// Insertion order, the stable secondary sort key
    seq: u64,
    item: WorkItem,
}

/// Mutex-guarded in-process ledger.
pub struct MemoryLedger {
    state: Mutex<State>,
    default_max_retries: u32,
}

impl MemoryLedger {
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            default_max_retries,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| HarvestError::storage("memory ledger mutex poisoned"))
    }

    /// Apply `update` to a Claimed item; anything else is left untouched.
    fn transition<F>(&self, item_id: &str, update: F) -> Result<Transition>
    where
        F: FnOnce(&mut WorkItem) -> WorkStatus,
    {
        let mut state = self.lock()?;
        let Some(entry) = state.items.get_mut(item_id) else {
            return Ok(Transition::Missing);
        };
        if entry.item.status != WorkStatus::Claimed {
            return Ok(Transition::Unchanged(entry.item.status));
        }
        let status = update(&mut entry.item);
        entry.item.status = status;
        if status != WorkStatus::Claimed {
            entry.item.claimed_at = None;
        }
        Ok(Transition::Applied(status))
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl WorkLedger for MemoryLedger {
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<usize> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut inserted = 0;

        for new_item in items {
            if state.items.contains_key(&new_item.item_id) {
                continue;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let item = new_item
                .clone()
                .into_pending(self.default_max_retries, now);
            state.items.insert(item.item_id.clone(), Entry { seq, item });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_batch(&self, limit: usize, partition: Option<&str>) -> Result<Vec<WorkItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut state = self.lock()?;

        let mut candidates: Vec<(i64, u64, String)> = state
            .items
            .values()
            .filter(|e| e.item.status == WorkStatus::Pending)
            .filter(|e| partition.is_none_or(|p| e.item.partition_key == p))
            .map(|e| (e.item.priority, e.seq, e.item.item_id.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, item_id) in candidates {
            if let Some(entry) = state.items.get_mut(&item_id) {
                entry.item.status = WorkStatus::Claimed;
                entry.item.claimed_at = Some(now);
                claimed.push(entry.item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        item_id: &str,
        latency_ms: u64,
        size_bytes: u64,
    ) -> Result<Transition> {
        let now = Utc::now();
        self.transition(item_id, |item| {
            item.completed_at = Some(now);
            item.latency_ms = Some(latency_ms);
            item.size_bytes = Some(size_bytes);
            WorkStatus::Completed
        })
    }

    async fn mark_failed(&self, item_id: &str, error: &ItemError) -> Result<Transition> {
        self.transition(item_id, |item| {
            let (retry_count, retryable) = next_retry(item.retry_count, item.max_retries);
            item.retry_count = retry_count;
            item.last_error = Some(error.clone());
            if retryable {
                WorkStatus::Pending
            } else {
                WorkStatus::Failed
            }
        })
    }

    async fn mark_invalid(&self, item_id: &str, reason: &str) -> Result<Transition> {
        self.transition(item_id, |item| {
            item.last_error = Some(ItemError::new("invalid", reason));
            WorkStatus::Invalid
        })
    }

    async fn release(&self, item_ids: &[String]) -> Result<usize> {
        let mut state = self.lock()?;
        let mut released = 0;
        for item_id in item_ids {
            if let Some(entry) = state.items.get_mut(item_id) {
                if entry.item.status == WorkStatus::Claimed {
                    entry.item.status = WorkStatus::Pending;
                    entry.item.claimed_at = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let Some(cutoff) = stale_cutoff(older_than) else {
            return Ok(0);
        };
        let mut state = self.lock()?;
        let mut reclaimed = 0;

        for entry in state.items.values_mut() {
            let item = &mut entry.item;
            if item.status != WorkStatus::Claimed {
                continue;
            }
            if item.claimed_at.is_none_or(|at| at <= cutoff) {
                item.status = WorkStatus::Pending;
                item.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<LedgerStats> {
        let state = self.lock()?;
        let mut stats = LedgerStats::default();
        for entry in state.items.values() {
            stats.add(&entry.item.partition_key, entry.item.status, 1);
        }
        Ok(stats)
    }

    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let state = self.lock()?;
        Ok(state.items.get(item_id).map(|e| e.item.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn items(count: usize, partitions: usize) -> Vec<NewWorkItem> {
        (0..count)
            .map(|i| {
                NewWorkItem::new(
                    format!("item_{i:03}"),
                    format!("p{}", i % partitions),
                    format!("https://example.com/{i}"),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let ledger = MemoryLedger::new(2);
        assert_eq!(ledger.insert_items(&items(5, 1)).await.unwrap(), 5);
        assert_eq!(ledger.insert_items(&items(7, 1)).await.unwrap(), 2);
        assert_eq!(ledger.stats().await.unwrap().totals.pending, 7);
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_insertion() {
        let ledger = MemoryLedger::default();
        ledger
            .insert_items(&[
                NewWorkItem::new("low", "p", "l"),
                NewWorkItem::new("high_a", "p", "a").with_priority(5),
                NewWorkItem::new("mid", "p", "m").with_priority(1),
                NewWorkItem::new("high_b", "p", "b").with_priority(5),
            ])
            .await
            .unwrap();

        let batch = ledger.claim_batch(3, None).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["high_a", "high_b", "mid"]);
        assert!(batch.iter().all(|i| i.status == WorkStatus::Claimed));
        assert!(batch.iter().all(|i| i.claimed_at.is_some()));
    }

    #[tokio::test]
    async fn test_claim_respects_partition_filter() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(10, 2)).await.unwrap();

        let batch = ledger.claim_batch(100, Some("p1")).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|i| i.partition_key == "p1"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let ledger = Arc::new(MemoryLedger::default());
        ledger.insert_items(&items(500, 3)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = ledger.claim_batch(7, None).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|i| i.item_id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "item delivered twice");
            }
        }
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn test_retry_count_until_failed() {
        let ledger = MemoryLedger::new(2);
        ledger.insert_items(&items(1, 1)).await.unwrap();
        let error = ItemError::new("503", "unavailable");

        let mut last = 0;
        for expected in [WorkStatus::Pending, WorkStatus::Pending, WorkStatus::Failed] {
            let claimed = ledger.claim_batch(1, None).await.unwrap();
            assert_eq!(claimed.len(), 1);
            let t = ledger.mark_failed("item_000", &error).await.unwrap();
            assert_eq!(t, Transition::Applied(expected));

            let item = ledger.get("item_000").await.unwrap().unwrap();
            assert!(item.retry_count > last);
            last = item.retry_count;
        }

        let item = ledger.get("item_000").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.last_error, Some(error));
        assert!(ledger.claim_batch(1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(1, 1)).await.unwrap();
        ledger.claim_batch(1, None).await.unwrap();

        let first = ledger.mark_completed("item_000", 120, 2048).await.unwrap();
        let second = ledger.mark_completed("item_000", 999, 1).await.unwrap();
        assert_eq!(first, Transition::Applied(WorkStatus::Completed));
        assert_eq!(second, Transition::Unchanged(WorkStatus::Completed));

        let item = ledger.get("item_000").await.unwrap().unwrap();
        assert_eq!(item.latency_ms, Some(120));
        assert_eq!(item.size_bytes, Some(2048));
        assert!(item.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_updates_require_claim() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(1, 1)).await.unwrap();

        let t = ledger.mark_invalid("item_000", "gone").await.unwrap();
        assert_eq!(t, Transition::Unchanged(WorkStatus::Pending));
        let t = ledger.mark_completed("nope", 1, 1).await.unwrap();
        assert_eq!(t, Transition::Missing);
    }

    #[tokio::test]
    async fn test_invalid_is_never_retried() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(1, 1)).await.unwrap();
        ledger.claim_batch(1, None).await.unwrap();

        let t = ledger.mark_invalid("item_000", "404").await.unwrap();
        assert_eq!(t, Transition::Applied(WorkStatus::Invalid));
        assert!(ledger.claim_batch(1, None).await.unwrap().is_empty());
        assert_eq!(ledger.reclaim_stale(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_stale_without_penalty() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(3, 1)).await.unwrap();
        ledger.claim_batch(3, None).await.unwrap();

        // Fresh claims survive a long timeout
        assert_eq!(ledger.reclaim_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(ledger.reclaim_stale(Duration::ZERO).await.unwrap(), 3);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.totals.pending, 3);
        let item = ledger.get("item_001").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 0);
        assert!(item.claimed_at.is_none());

        assert_eq!(ledger.claim_batch(10, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reclaim_with_unrepresentable_age_reclaims_nothing() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(2, 1)).await.unwrap();
        ledger.claim_batch(2, None).await.unwrap();

        let reclaimed = ledger
            .reclaim_stale(Duration::from_secs(10_000_000_000_000))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
        assert_eq!(ledger.stats().await.unwrap().totals.claimed, 2);
    }

    #[tokio::test]
    async fn test_release_returns_claimed_only() {
        let ledger = MemoryLedger::default();
        ledger.insert_items(&items(3, 1)).await.unwrap();
        let batch = ledger.claim_batch(2, None).await.unwrap();
        ledger.mark_completed(&batch[0].item_id, 1, 1).await.unwrap();

        let ids: Vec<String> = batch.iter().map(|i| i.item_id.clone()).collect();
        assert_eq!(ledger.release(&ids).await.unwrap(), 1);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.totals.pending, 2);
        assert_eq!(stats.totals.completed, 1);
    }
}
