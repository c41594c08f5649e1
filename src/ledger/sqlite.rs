//! SQLite ledger implementation.
//!
//! Claims run as a single `UPDATE … RETURNING` inside a `BEGIN IMMEDIATE`
//! transaction: the write lock is taken before the Pending rows are selected,
//! so no other connection can select the same rows in between.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior, params};

use crate::db::{Database, from_millis, from_millis_opt, parse_text, to_millis};
use crate::error::Result;
use crate::ledger::{WorkLedger, next_retry, stale_cutoff};
use crate::models::{ItemError, LedgerStats, NewWorkItem, Transition, WorkItem, WorkStatus};

const ITEM_COLUMNS: &str = "seq, item_id, partition_key, priority, source_locator, status, \
     retry_count, max_retries, created_at, claimed_at, completed_at, \
     last_error_code, last_error_message, latency_ms, size_bytes";

/// SQLite-backed durable ledger.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    db: Database,
    default_max_retries: u32,
}

impl SqliteLedger {
    pub fn new(db: Database, default_max_retries: u32) -> Self {
        Self {
            db,
            default_max_retries,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Apply `update` to a Claimed item inside one immediate transaction.
    async fn transition<F>(&self, item_id: &str, update: F) -> Result<Transition>
    where
        F: FnOnce(&Transaction<'_>, &ClaimedRow) -> Result<WorkStatus> + Send + 'static,
    {
        let item_id = item_id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let row = tx
                    .query_row(
                        "SELECT status, retry_count, max_retries FROM work_items WHERE item_id = ?1",
                        params![item_id],
                        |row| {
                            let status: String = row.get(0)?;
                            Ok(ClaimedRow {
                                item_id: item_id.clone(),
                                status: parse_text(0, &status)?,
                                retry_count: row.get(1)?,
                                max_retries: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;

                let transition = match row {
                    None => Transition::Missing,
                    Some(row) if row.status != WorkStatus::Claimed => {
                        Transition::Unchanged(row.status)
                    }
                    Some(row) => Transition::Applied(update(&tx, &row)?),
                };
                tx.commit()?;
                Ok(transition)
            })
            .await
    }
}

/// Current state of an item about to be transitioned.
struct ClaimedRow {
    item_id: String,
    status: WorkStatus,
    retry_count: u32,
    max_retries: u32,
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<(i64, WorkItem)> {
    let status: String = row.get(5)?;
    let error_code: Option<String> = row.get(11)?;
    let error_message: Option<String> = row.get(12)?;
    let latency_ms: Option<i64> = row.get(13)?;
    let size_bytes: Option<i64> = row.get(14)?;

    let item = WorkItem {
        item_id: row.get(1)?,
        partition_key: row.get(2)?,
        priority: row.get(3)?,
        source_locator: row.get(4)?,
        status: parse_text(5, &status)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        created_at: from_millis(8, row.get(8)?)?,
        claimed_at: from_millis_opt(9, row.get(9)?)?,
        completed_at: from_millis_opt(10, row.get(10)?)?,
        last_error: error_code.map(|code| ItemError {
            code,
            message: error_message.unwrap_or_default(),
        }),
        latency_ms: latency_ms.map(|v| v.max(0) as u64),
        size_bytes: size_bytes.map(|v| v.max(0) as u64),
    };
    Ok((row.get(0)?, item))
}

fn to_sql_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl WorkLedger for SqliteLedger {
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<usize> {
        let items = items.to_vec();
        let default_max_retries = self.default_max_retries;
        self.db
            .call(move |conn| {
                let now = to_millis(Utc::now());
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO work_items
                            (item_id, partition_key, priority, source_locator, status,
                             retry_count, max_retries, created_at)
                         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
                    )?;
                    for item in &items {
                        inserted += stmt.execute(params![
                            item.item_id,
                            item.partition_key,
                            item.priority,
                            item.source_locator,
                            item.max_retries.unwrap_or(default_max_retries),
                            now,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await
    }

    async fn claim_batch(&self, limit: usize, partition: Option<&str>) -> Result<Vec<WorkItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let partition = partition.map(str::to_string);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        self.db
            .call(move |conn| {
                let now = to_millis(Utc::now());
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut claimed = {
                    let mut stmt = tx.prepare(&format!(
                        "UPDATE work_items
                         SET status = 'claimed', claimed_at = ?1
                         WHERE seq IN (
                             SELECT seq FROM work_items
                             WHERE status = 'pending'
                               AND (?2 IS NULL OR partition_key = ?2)
                             ORDER BY priority DESC, seq ASC
                             LIMIT ?3
                         )
                         RETURNING {ITEM_COLUMNS}"
                    ))?;
                    stmt.query_map(params![now, partition, limit], row_to_item)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                };
                tx.commit()?;

                // RETURNING order is unspecified
                claimed.sort_by(|(seq_a, a), (seq_b, b)| {
                    b.priority.cmp(&a.priority).then(seq_a.cmp(seq_b))
                });
                Ok(claimed.into_iter().map(|(_, item)| item).collect())
            })
            .await
    }

    async fn mark_completed(
        &self,
        item_id: &str,
        latency_ms: u64,
        size_bytes: u64,
    ) -> Result<Transition> {
        self.transition(item_id, move |tx, row| {
            tx.execute(
                "UPDATE work_items
                 SET status = 'completed', claimed_at = NULL, completed_at = ?2,
                     latency_ms = ?3, size_bytes = ?4
                 WHERE item_id = ?1",
                params![
                    row.item_id,
                    to_millis(Utc::now()),
                    to_sql_u64(latency_ms),
                    to_sql_u64(size_bytes)
                ],
            )?;
            Ok(WorkStatus::Completed)
        })
        .await
    }

    async fn mark_failed(&self, item_id: &str, error: &ItemError) -> Result<Transition> {
        let error = error.clone();
        self.transition(item_id, move |tx, row| {
            let (retry_count, retryable) = next_retry(row.retry_count, row.max_retries);
            let status = if retryable {
                WorkStatus::Pending
            } else {
                WorkStatus::Failed
            };
            tx.execute(
                "UPDATE work_items
                 SET status = ?2, claimed_at = NULL, retry_count = ?3,
                     last_error_code = ?4, last_error_message = ?5
                 WHERE item_id = ?1",
                params![
                    row.item_id,
                    status.as_str(),
                    retry_count,
                    error.code,
                    error.message
                ],
            )?;
            Ok(status)
        })
        .await
    }

    async fn mark_invalid(&self, item_id: &str, reason: &str) -> Result<Transition> {
        let reason = reason.to_string();
        self.transition(item_id, move |tx, row| {
            tx.execute(
                "UPDATE work_items
                 SET status = 'invalid', claimed_at = NULL,
                     last_error_code = 'invalid', last_error_message = ?2
                 WHERE item_id = ?1",
                params![row.item_id, reason],
            )?;
            Ok(WorkStatus::Invalid)
        })
        .await
    }

    async fn release(&self, item_ids: &[String]) -> Result<usize> {
        let item_ids = item_ids.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut released = 0;
                {
                    let mut stmt = tx.prepare(
                        "UPDATE work_items SET status = 'pending', claimed_at = NULL
                         WHERE item_id = ?1 AND status = 'claimed'",
                    )?;
                    for item_id in &item_ids {
                        released += stmt.execute(params![item_id])?;
                    }
                }
                tx.commit()?;
                Ok(released)
            })
            .await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<usize> {
        let Some(cutoff) = stale_cutoff(older_than).map(to_millis) else {
            return Ok(0);
        };
        self.db
            .call(move |conn| {
                let reclaimed = conn.execute(
                    "UPDATE work_items SET status = 'pending', claimed_at = NULL
                     WHERE status = 'claimed' AND claimed_at <= ?1",
                    params![cutoff],
                )?;
                Ok(reclaimed)
            })
            .await
    }

    async fn stats(&self) -> Result<LedgerStats> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT partition_key, status, COUNT(*) FROM work_items
                     GROUP BY partition_key, status",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let partition: String = row.get(0)?;
                        let status: String = row.get(1)?;
                        let count: i64 = row.get(2)?;
                        Ok((partition, parse_text::<WorkStatus>(1, &status)?, count))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut stats = LedgerStats::default();
                for (partition, status, count) in rows {
                    stats.add(&partition, status, count.max(0) as usize);
                }
                Ok(stats)
            })
            .await
    }

    async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        let item_id = item_id.to_string();
        self.db
            .call(move |conn| {
                let item = conn
                    .query_row(
                        &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE item_id = ?1"),
                        params![item_id],
                        row_to_item,
                    )
                    .optional()?;
                Ok(item.map(|(_, item)| item))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ledger(tmp: &TempDir, max_retries: u32) -> SqliteLedger {
        let db = Database::open(tmp.path().join("ledger.db"), Duration::from_secs(10)).unwrap();
        SqliteLedger::new(db, max_retries)
    }

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
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);

        assert_eq!(ledger.insert_items(&items(4, 2)).await.unwrap(), 4);
        assert_eq!(ledger.insert_items(&items(6, 2)).await.unwrap(), 2);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.totals.pending, 6);
        assert_eq!(stats.by_partition["p0"].pending, 3);
    }

    #[tokio::test]
    async fn test_claim_order_and_fields() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
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
        assert!(
            batch
                .iter()
                .all(|i| i.status == WorkStatus::Claimed && i.claimed_at.is_some())
        );

        let remaining = ledger.claim_batch(10, Some("p")).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].item_id, "low");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_overlap() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(ledger(&tmp, 3));
        ledger.insert_items(&items(200, 2)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = ledger.claim_batch(5, None).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|i| i.item_id));
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "item delivered twice");
            }
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(ledger.stats().await.unwrap().totals.claimed, 200);
    }

    #[tokio::test]
    async fn test_retry_until_failed() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
        ledger
            .insert_items(&[NewWorkItem::new("x", "p", "u").with_max_retries(1)])
            .await
            .unwrap();
        let error = ItemError::new("ECONNRESET", "connection reset");

        ledger.claim_batch(1, None).await.unwrap();
        assert_eq!(
            ledger.mark_failed("x", &error).await.unwrap(),
            Transition::Applied(WorkStatus::Pending)
        );
        ledger.claim_batch(1, None).await.unwrap();
        assert_eq!(
            ledger.mark_failed("x", &error).await.unwrap(),
            Transition::Applied(WorkStatus::Failed)
        );

        let item = ledger.get("x").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.last_error, Some(error));
        assert!(item.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
        ledger.insert_items(&items(1, 1)).await.unwrap();
        ledger.claim_batch(1, None).await.unwrap();

        assert!(
            ledger
                .mark_completed("item_000", 250, 4096)
                .await
                .unwrap()
                .is_applied()
        );
        assert_eq!(
            ledger.mark_completed("item_000", 1, 1).await.unwrap(),
            Transition::Unchanged(WorkStatus::Completed)
        );

        let item = ledger.get("item_000").await.unwrap().unwrap();
        assert_eq!(item.latency_ms, Some(250));
        assert_eq!(item.size_bytes, Some(4096));
    }

    #[tokio::test]
    async fn test_mark_invalid_and_missing() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
        ledger.insert_items(&items(1, 1)).await.unwrap();

        assert_eq!(
            ledger.mark_invalid("item_000", "gone").await.unwrap(),
            Transition::Unchanged(WorkStatus::Pending)
        );
        ledger.claim_batch(1, None).await.unwrap();
        assert_eq!(
            ledger.mark_invalid("item_000", "gone").await.unwrap(),
            Transition::Applied(WorkStatus::Invalid)
        );
        assert_eq!(
            ledger.mark_failed("nope", &ItemError::new("x", "y")).await.unwrap(),
            Transition::Missing
        );
    }

    #[tokio::test]
    async fn test_reclaim_stale_and_release() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
        ledger.insert_items(&items(5, 1)).await.unwrap();
        let batch = ledger.claim_batch(5, None).await.unwrap();

        assert_eq!(ledger.reclaim_stale(Duration::from_secs(600)).await.unwrap(), 0);

        let first_two: Vec<String> = batch[..2].iter().map(|i| i.item_id.clone()).collect();
        assert_eq!(ledger.release(&first_two).await.unwrap(), 2);
        assert_eq!(ledger.reclaim_stale(Duration::ZERO).await.unwrap(), 3);

        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.totals.pending, 5);
        assert_eq!(stats.totals.claimed, 0);
        let item = ledger.get("item_004").await.unwrap().unwrap();
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn test_reclaim_with_unrepresentable_age_reclaims_nothing() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp, 3);
        ledger.insert_items(&items(2, 1)).await.unwrap();
        ledger.claim_batch(2, None).await.unwrap();

        let reclaimed = ledger
            .reclaim_stale(Duration::from_secs(10_000_000_000_000))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
        let item = ledger.get("item_000").await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Claimed);
        assert!(item.claimed_at.is_some());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let ledger = ledger(&tmp, 3);
            ledger.insert_items(&items(3, 1)).await.unwrap();
            ledger.claim_batch(3, None).await.unwrap();
        }

        let ledger = ledger(&tmp, 3);
        assert_eq!(ledger.stats().await.unwrap().totals.claimed, 3);
        assert_eq!(ledger.reclaim_stale(Duration::ZERO).await.unwrap(), 3);
        assert_eq!(ledger.claim_batch(10, None).await.unwrap().len(), 3);
    }
}
