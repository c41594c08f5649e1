// src/models/work_item.rs

//! Work items and the status lifecycle they move through.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Lifecycle status of a work item.
///
/// ```text
/// Pending ──claim──▶ Claimed ──▶ Completed
///    ▲                  │  ├───▶ Invalid
///    └──retry/reclaim───┘  └───▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Invalid,
}

impl WorkStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Pending => "pending",
            WorkStatus::Claimed => "claimed",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
            WorkStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkStatus::Pending),
            "claimed" => Ok(WorkStatus::Claimed),
            "completed" => Ok(WorkStatus::Completed),
            "failed" => Ok(WorkStatus::Failed),
            "invalid" => Ok(WorkStatus::Invalid),
            other => Err(HarvestError::storage(format!(
                "unknown work status '{other}'"
            ))),
        }
    }
}

/// Code and message of the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// One unit of crawlable work as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub partition_key: String,
    /// Higher priorities are claimed first
    pub priority: i64,
    pub source_locator: String,
    pub status: WorkStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    /// Always set while `status == Claimed`
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<ItemError>,
    pub latency_ms: Option<u64>,
    pub size_bytes: Option<u64>,
}

/// Insert form produced by a discovery process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub item_id: String,
    pub partition_key: String,
    #[serde(default)]
    pub priority: i64,
    pub source_locator: String,
    /// Falls back to the ledger default when absent
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewWorkItem {
    pub fn new(
        item_id: impl Into<String>,
        partition_key: impl Into<String>,
        source_locator: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            partition_key: partition_key.into(),
            priority: 0,
            source_locator: source_locator.into(),
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Materialize as a fresh Pending item.
    pub fn into_pending(self, default_max_retries: u32, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            item_id: self.item_id,
            partition_key: self.partition_key,
            priority: self.priority,
            source_locator: self.source_locator,
            status: WorkStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            claimed_at: None,
            completed_at: None,
            last_error: None,
            latency_ms: None,
            size_bytes: None,
        }
    }
}

/// Result of a terminal ledger update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The item moved to the given status.
    Applied(WorkStatus),
    /// The item was not Claimed; nothing was written. Carries its current status.
    Unchanged(WorkStatus),
    /// No item with that id exists.
    Missing,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    /// Status after the update, if the item exists.
    pub fn status(&self) -> Option<WorkStatus> {
        match self {
            Transition::Applied(s) | Transition::Unchanged(s) => Some(*s),
            Transition::Missing => None,
        }
    }
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub invalid: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: WorkStatus, count: usize) {
        match status {
            WorkStatus::Pending => self.pending += count,
            WorkStatus::Claimed => self.claimed += count,
            WorkStatus::Completed => self.completed += count,
            WorkStatus::Failed => self.failed += count,
            WorkStatus::Invalid => self.invalid += count,
        }
    }

    pub fn get(&self, status: WorkStatus) -> usize {
        match status {
            WorkStatus::Pending => self.pending,
            WorkStatus::Claimed => self.claimed,
            WorkStatus::Completed => self.completed,
            WorkStatus::Failed => self.failed,
            WorkStatus::Invalid => self.invalid,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.completed + self.failed + self.invalid
    }
}

/// Ledger counts, globally and per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub totals: StatusCounts,
    pub by_partition: BTreeMap<String, StatusCounts>,
}

impl LedgerStats {
    /// Record `count` items of `status` in `partition`.
    pub fn add(&mut self, partition: &str, status: WorkStatus, count: usize) {
        self.totals.add(status, count);
        self.by_partition
            .entry(partition.to_string())
            .or_default()
            .add(status, count);
    }
}
