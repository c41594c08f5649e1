//! Extractor contract: turns one source locator into an outcome.
//!
//! Field extraction itself lives outside the engine. The crate ships only a
//! thin HTTP adapter (feature `http`) so a run can be driven end to end.

#[cfg(feature = "http")]
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(feature = "http")]
pub use http::HttpExtractor;

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Payload fetched and scored
    Success {
        payload: Value,
        /// 0.0 to 1.0; compared against `harvest.min_quality`
        quality_score: f64,
        latency_ms: u64,
        size_bytes: u64,
    },
    /// The resource does not exist at the remote
    NotFound,
    /// The remote asked us to slow down
    RateLimited { retry_after: Option<Duration> },
    TransientError { code: String, message: String },
    Fatal { code: String, message: String },
}

impl Outcome {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientError {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Trait for document fetchers.
///
/// Implementations report every failure through [`Outcome`]; they must not
/// panic, although the orchestrator isolates a panic to the one item.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, source_locator: &str, timeout: Duration) -> Outcome;
}
