// src/models/session.rs

//! Session aggregates and the per-item error log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Aggregate record of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub total_bytes: u64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at,
            ended_at: None,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            avg_latency_ms: 0.0,
            total_bytes: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Fold one attempt into the running aggregates.
    pub fn apply_attempt(&mut self, success: bool, latency_ms: u64, bytes: u64) {
        let total_latency = self.avg_latency_ms * self.attempted as f64 + latency_ms as f64;
        self.attempted += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_bytes += bytes;
        self.avg_latency_ms = total_latency / self.attempted as f64;
    }

    /// Fraction of attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.attempted as f64
        }
    }
}

/// Broad category of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection reset and other retryable network faults
    Transient,
    /// Extraction exceeded its deadline
    Timeout,
    /// Explicit rate-limit signal from the remote
    RateLimited,
    /// 5xx from the remote
    ServerError,
    /// Anything the extractor could not classify
    Unexpected,
    /// Ledger or sink failure while writing results
    Storage,
    /// Fault inside the worker itself
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Unexpected => "unexpected",
            ErrorClass::Storage => "storage",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "timeout" => Ok(ErrorClass::Timeout),
            "rate_limited" => Ok(ErrorClass::RateLimited),
            "server_error" => Ok(ErrorClass::ServerError),
            "unexpected" => Ok(ErrorClass::Unexpected),
            "storage" => Ok(ErrorClass::Storage),
            "internal" => Ok(ErrorClass::Internal),
            other => Err(HarvestError::storage(format!(
                "unknown error class '{other}'"
            ))),
        }
    }
}

/// Error details handed to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub retry_attempt: u32,
}

/// One append-only entry in the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub session_id: String,
    pub item_id: String,
    pub error_class: ErrorClass,
    pub error_code: String,
    pub message: String,
    pub retry_attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(session_id: &str, item_id: &str, detail: &ErrorDetail) -> Self {
        Self {
            session_id: session_id.to_string(),
            item_id: item_id.to_string(),
            error_class: detail.class,
            error_code: detail.code.clone(),
            message: detail.message.clone(),
            retry_attempt: detail.retry_attempt,
            occurred_at: Utc::now(),
        }
    }
}
