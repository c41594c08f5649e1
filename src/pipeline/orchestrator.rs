// src/pipeline/orchestrator.rs

//! Harvest orchestrator: a fixed pool of workers draining the ledger.
//!
//! Each worker loops: claim a batch, then for every item wait on the shared
//! governor, extract, classify and write the result back. Cancellation is
//! observed between items and while waiting on the governor, never in the
//! middle of an extraction. Items a worker claimed but never started are
//! released back to Pending.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{HarvestError, Result};
use crate::extractor::Extractor;
use crate::ledger::{WorkLedger, next_retry};
use crate::models::{HarvestConfig, LedgerStats, Session, Transition, WorkItem, WorkStatus};
use crate::pipeline::classify::{RetryCause, Verdict, classify};
use crate::pipeline::governor::RateGovernor;
use crate::sink::{NullSink, PayloadSink};
use crate::tracker::SessionTracker;
use crate::utils;

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub worker_count: usize,
    pub batch_size: usize,
    /// Global cap on claimed batches across all workers
    pub max_batches: Option<usize>,
    pub partition: Option<String>,
    pub extract_timeout: Duration,
    pub min_quality: f64,
    pub max_claim_errors: u32,
    /// Sweep claims at least this old back to Pending before starting
    pub reclaim_stale_after: Option<Duration>,
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(HarvestError::validation("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(HarvestError::validation("batch_size must be at least 1"));
        }
        if self.max_claim_errors == 0 {
            return Err(HarvestError::validation(
                "max_claim_errors must be at least 1",
            ));
        }
        Ok(())
    }
}

impl From<&HarvestConfig> for RunOptions {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            batch_size: config.batch_size,
            max_batches: config.max_batches,
            partition: config.partition.clone(),
            extract_timeout: config.extract_timeout(),
            min_quality: config.min_quality,
            max_claim_errors: config.max_claim_errors,
            reclaim_stale_after: None,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Closed session with final aggregates
    pub session: Session,
    /// Stale claims swept before the workers started
    pub reclaimed: usize,
    /// Non-empty batches claimed
    pub batches: usize,
    /// Claimed items handed back unstarted on cancellation
    pub released: usize,
    pub cancelled: bool,
    /// Workers that stopped early, with the cause
    pub worker_errors: Vec<String>,
    pub error_records: usize,
    pub ledger: LedgerStats,
    pub elapsed: Duration,
}

impl RunReport {
    /// Key/value rows for [`utils::log::summary`].
    pub fn summary_items(&self) -> Vec<(&'static str, String)> {
        let totals = &self.ledger.totals;
        vec![
            ("session", self.session.session_id.clone()),
            ("elapsed", utils::format_elapsed(self.elapsed)),
            ("attempted", self.session.attempted.to_string()),
            ("succeeded", self.session.succeeded.to_string()),
            ("failed", self.session.failed.to_string()),
            (
                "success rate",
                format!("{:.1}%", self.session.success_rate() * 100.0),
            ),
            ("avg latency", format!("{:.0} ms", self.session.avg_latency_ms)),
            ("bytes", self.session.total_bytes.to_string()),
            ("error records", self.error_records.to_string()),
            ("batches", self.batches.to_string()),
            ("reclaimed", self.reclaimed.to_string()),
            ("released", self.released.to_string()),
            (
                "ledger",
                format!(
                    "pending={} claimed={} completed={} failed={} invalid={}",
                    totals.pending, totals.claimed, totals.completed, totals.failed, totals.invalid
                ),
            ),
        ]
    }
}

/// Owns the collaborators of a run.
pub struct Harvester {
    ledger: Arc<dyn WorkLedger>,
    tracker: Arc<dyn SessionTracker>,
    governor: Arc<RateGovernor>,
    extractor: Arc<dyn Extractor>,
    sink: Arc<dyn PayloadSink>,
}

impl Harvester {
    /// Create a harvester that discards payloads.
    pub fn new(
        ledger: Arc<dyn WorkLedger>,
        tracker: Arc<dyn SessionTracker>,
        governor: Arc<RateGovernor>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            ledger,
            tracker,
            governor,
            extractor,
            sink: Arc::new(NullSink),
        }
    }

    /// Persist successful payloads through `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn PayloadSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Drain the ledger until it is empty, the batch budget is spent or
    /// `cancel` fires.
    pub async fn run(&self, options: RunOptions, cancel: CancellationToken) -> Result<RunReport> {
        options.validate()?;
        let started = Instant::now();

        let reclaimed = match options.reclaim_stale_after {
            Some(age) => {
                let reclaimed = self.ledger.reclaim_stale(age).await?;
                if reclaimed > 0 {
                    log::warn!("Reclaimed {} stale claims from an earlier run", reclaimed);
                }
                reclaimed
            }
            None => 0,
        };

        let session_id = self.tracker.open_session().await?;
        utils::log::header(&format!("Harvest session {session_id}"));
        utils::log::sub_item(&format!(
            "{} workers, batch size {}, partition {}",
            options.worker_count,
            options.batch_size,
            options.partition.as_deref().unwrap_or("*")
        ));

        let worker_count = options.worker_count;
        let shared = Arc::new(Shared {
            ledger: Arc::clone(&self.ledger),
            tracker: Arc::clone(&self.tracker),
            governor: Arc::clone(&self.governor),
            extractor: Arc::clone(&self.extractor),
            sink: Arc::clone(&self.sink),
            session_id: session_id.clone(),
            options,
            permits: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });

        let handles: Vec<_> = (0..worker_count)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                tokio::spawn(async move { shared.run_worker(worker_id, cancel).await })
            })
            .collect();

        let mut worker_errors = Vec::new();
        for (worker_id, handle) in handles.into_iter().enumerate() {
            let failure = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => HarvestError::from(e),
            };
            log::error!("Worker {} stopped: {}", worker_id, failure);
            worker_errors.push(format!("worker {worker_id}: {failure}"));
        }

        let session = self.tracker.close_session(&session_id).await?;
        let error_records = self.tracker.error_count(&session_id).await?;
        let ledger = self.ledger.stats().await?;

        let report = RunReport {
            session,
            reclaimed,
            batches: shared.batches.load(Ordering::SeqCst),
            released: shared.released.load(Ordering::SeqCst),
            cancelled: cancel.is_cancelled(),
            worker_errors,
            error_records,
            ledger,
            elapsed: started.elapsed(),
        };
        utils::log::summary("Harvest run", &report.summary_items());
        Ok(report)
    }
}

/// State shared by the workers of one run.
struct Shared {
    ledger: Arc<dyn WorkLedger>,
    tracker: Arc<dyn SessionTracker>,
    governor: Arc<RateGovernor>,
    extractor: Arc<dyn Extractor>,
    sink: Arc<dyn PayloadSink>,
    session_id: String,
    options: RunOptions,
    /// Claim attempts counted against `max_batches`
    permits: AtomicUsize,
    batches: AtomicUsize,
    released: AtomicUsize,
}

impl Shared {
    fn take_batch_permit(&self) -> bool {
        match self.options.max_batches {
            None => true,
            Some(max) => self
                .permits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    fn return_batch_permit(&self) {
        if self.options.max_batches.is_some() {
            self.permits.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run_worker(&self, worker_id: usize, cancel: CancellationToken) -> Result<()> {
        let mut claim_errors = 0u32;
        log::debug!("Worker {} started", worker_id);

        loop {
            if cancel.is_cancelled() || !self.take_batch_permit() {
                break;
            }

            let batch = match self
                .ledger
                .claim_batch(self.options.batch_size, self.options.partition.as_deref())
                .await
            {
                Ok(batch) => {
                    claim_errors = 0;
                    batch
                }
                Err(e) => {
                    self.return_batch_permit();
                    claim_errors += 1;
                    if claim_errors >= self.options.max_claim_errors {
                        return Err(e);
                    }
                    log::warn!(
                        "Worker {}: claim failed ({}/{}): {}",
                        worker_id,
                        claim_errors,
                        self.options.max_claim_errors,
                        e
                    );
                    let pause = Duration::from_millis(100 * u64::from(claim_errors));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            };

            if batch.is_empty() {
                log::debug!("Worker {}: ledger drained", worker_id);
                break;
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            log::debug!("Worker {}: claimed {} items", worker_id, batch.len());

            let mut items = batch.into_iter();
            while let Some(item) = items.next() {
                let cancelled = cancel.is_cancelled()
                    || tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = self.governor.throttle() => false,
                    };
                if cancelled {
                    let unstarted: Vec<String> = std::iter::once(item)
                        .chain(items)
                        .map(|item| item.item_id)
                        .collect();
                    self.release(worker_id, &unstarted).await;
                    return Ok(());
                }
                self.handle_item(item).await;
            }
        }

        log::debug!("Worker {} finished", worker_id);
        Ok(())
    }

    async fn release(&self, worker_id: usize, item_ids: &[String]) {
        match self.ledger.release(item_ids).await {
            Ok(released) => {
                self.released.fetch_add(released, Ordering::SeqCst);
                log::info!("Worker {}: released {} unstarted items", worker_id, released);
            }
            Err(e) => log::error!(
                "Worker {}: failed to release {} items, left for stale reclaim: {}",
                worker_id,
                item_ids.len(),
                e
            ),
        }
    }

    /// Process one item; a panic is confined to that item.
    async fn handle_item(&self, item: WorkItem) {
        let started = Instant::now();
        let result = AssertUnwindSafe(self.process(&item, started))
            .catch_unwind()
            .await;

        if let Err(panic) = result {
            let message = panic_message(&*panic);
            log::error!("Panic while processing {}: {}", item.item_id, message);
            let latency_ms = utils::duration_ms(started.elapsed());
            self.retry(&item, RetryCause::internal(message), latency_ms)
                .await;
        }
    }

    async fn process(&self, item: &WorkItem, started: Instant) {
        let timeout = self.options.extract_timeout;
        let verdict = match tokio::time::timeout(
            timeout,
            self.extractor.extract(&item.source_locator, timeout),
        )
        .await
        {
            Ok(outcome) => classify(outcome, self.options.min_quality),
            Err(_) => Verdict::Retry(RetryCause::timeout(timeout)),
        };
        let elapsed_ms = utils::duration_ms(started.elapsed());

        match verdict {
            Verdict::Complete {
                payload,
                latency_ms,
                size_bytes,
            } => self.complete(item, &payload, latency_ms, size_bytes).await,
            Verdict::Invalid { reason, not_found } => {
                match self.ledger.mark_invalid(&item.item_id, &reason).await {
                    Ok(Transition::Applied(_)) => {
                        log::info!("{} is invalid: {}", item.item_id, reason);
                        self.record_attempt(false, elapsed_ms, 0).await;
                    }
                    Ok(other) => log::debug!("{} not marked invalid: {:?}", item.item_id, other),
                    Err(e) => {
                        self.retry(item, RetryCause::storage(e.to_string()), elapsed_ms)
                            .await
                    }
                }
                if not_found {
                    self.governor.on_success(404);
                }
            }
            Verdict::Retry(cause) => self.retry(item, cause, elapsed_ms).await,
        }
    }

    async fn complete(
        &self,
        item: &WorkItem,
        payload: &serde_json::Value,
        latency_ms: u64,
        size_bytes: u64,
    ) {
        if let Err(e) = self.sink.store(item, payload).await {
            self.retry(item, RetryCause::storage(e.to_string()), latency_ms)
                .await;
            return;
        }

        match self
            .ledger
            .mark_completed(&item.item_id, latency_ms, size_bytes)
            .await
        {
            Ok(Transition::Applied(_)) => {
                self.record_attempt(true, latency_ms, size_bytes).await;
                self.governor.on_success(200);
            }
            Ok(other) => log::debug!("{} already settled: {:?}", item.item_id, other),
            Err(e) => {
                self.retry(item, RetryCause::storage(e.to_string()), latency_ms)
                    .await
            }
        }
    }

    async fn retry(&self, item: &WorkItem, cause: RetryCause, latency_ms: u64) {
        if let Some(rejection) = cause.rejection {
            self.governor
                .on_rejection(rejection.status_code, rejection.retry_after);
        }

        // The error log is written before the item becomes claimable again.
        let (attempt, retryable) = next_retry(item.retry_count, item.max_retries);
        if retryable {
            let detail = cause.detail(attempt);
            if let Err(e) = self
                .tracker
                .record_error(&self.session_id, &item.item_id, &detail)
                .await
            {
                log::warn!("Failed to record error for {}: {}", item.item_id, e);
            }
        }

        match self
            .ledger
            .mark_failed(&item.item_id, &cause.item_error())
            .await
        {
            Ok(Transition::Applied(status)) => {
                self.record_attempt(false, latency_ms, 0).await;
                if status == WorkStatus::Pending {
                    log::debug!(
                        "{} will be retried (attempt {}): [{}] {}",
                        item.item_id,
                        attempt,
                        cause.class,
                        cause.message
                    );
                } else {
                    log::warn!(
                        "{} failed after {} attempts: [{}] {}",
                        item.item_id,
                        attempt,
                        cause.class,
                        cause.message
                    );
                }
            }
            Ok(other) => log::debug!("{} not marked failed: {:?}", item.item_id, other),
            Err(e) => log::error!(
                "Failed to record failure of {}, left claimed for stale reclaim: {}",
                item.item_id,
                e
            ),
        }
    }

    async fn record_attempt(&self, success: bool, latency_ms: u64, bytes: u64) {
        if let Err(e) = self
            .tracker
            .record_attempt(&self.session_id, success, latency_ms, bytes)
            .await
        {
            log::warn!("Failed to update session {}: {}", self.session_id, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
