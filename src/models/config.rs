//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool and classification settings
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Request pacing and backoff
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Durable queue settings
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// HTTP extractor settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Where successful payloads are written
    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.harvest.worker_count == 0 {
            return Err(HarvestError::validation("harvest.worker_count must be > 0"));
        }
        if self.harvest.batch_size == 0 {
            return Err(HarvestError::validation("harvest.batch_size must be > 0"));
        }
        if self.harvest.extract_timeout_secs == 0 {
            return Err(HarvestError::validation(
                "harvest.extract_timeout_secs must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.harvest.min_quality) {
            return Err(HarvestError::validation(
                "harvest.min_quality must be within 0.0..=1.0",
            ));
        }
        self.governor.validate()?;
        if self.ledger.database_path.as_os_str().is_empty() {
            return Err(HarvestError::validation("ledger.database_path is empty"));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(HarvestError::validation("http.user_agent is empty"));
        }
        Ok(())
    }
}

/// Worker pool and classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "defaults::worker_count")]
    pub worker_count: usize,

    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Global cap on claimed batches per run (unbounded when absent)
    #[serde(default)]
    pub max_batches: Option<usize>,

    /// Only claim items from this partition
    #[serde(default)]
    pub partition: Option<String>,

    /// Upper bound for a single extraction call
    #[serde(default = "defaults::extract_timeout")]
    pub extract_timeout_secs: u64,

    /// Claimed items older than this are presumed abandoned
    #[serde(default = "defaults::staleness_timeout")]
    pub staleness_timeout_secs: u64,

    /// Payloads scored below this are treated as unusable
    #[serde(default)]
    pub min_quality: f64,

    /// Consecutive claim failures before a worker gives up
    #[serde(default = "defaults::max_claim_errors")]
    pub max_claim_errors: u32,
}

impl HarvestConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_timeout_secs)
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::worker_count(),
            batch_size: defaults::batch_size(),
            max_batches: None,
            partition: None,
            extract_timeout_secs: defaults::extract_timeout(),
            staleness_timeout_secs: defaults::staleness_timeout(),
            min_quality: 0.0,
            max_claim_errors: defaults::max_claim_errors(),
        }
    }
}

/// How post-rejection delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Rate governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Requests per second when the remote is healthy
    #[serde(default = "defaults::target_rate")]
    pub target_rate: f64,

    /// Tokens that may accumulate while idle
    #[serde(default = "defaults::burst")]
    pub burst: u32,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Base (and minimum) post-rejection delay
    #[serde(default = "defaults::floor_delay")]
    pub floor_delay_ms: u64,

    /// Maximum post-rejection delay
    #[serde(default = "defaults::ceiling_delay")]
    pub ceiling_delay_ms: u64,

    /// Increment per failure under the linear policy
    #[serde(default = "defaults::linear_step")]
    pub linear_step_ms: u64,

    /// Consecutive successes needed before relaxing a slowdown
    #[serde(default = "defaults::recovery_threshold")]
    pub recovery_threshold: u32,

    /// Rate multiplier applied on each relaxation step
    #[serde(default = "defaults::recovery_factor")]
    pub recovery_factor: f64,
}

impl GovernorConfig {
    pub fn floor_delay(&self) -> Duration {
        Duration::from_millis(self.floor_delay_ms)
    }

    pub fn ceiling_delay(&self) -> Duration {
        Duration::from_millis(self.ceiling_delay_ms)
    }

    pub fn linear_step(&self) -> Duration {
        Duration::from_millis(self.linear_step_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.target_rate.is_finite() && self.target_rate > 0.0) {
            return Err(HarvestError::validation("governor.target_rate must be > 0"));
        }
        if self.burst == 0 {
            return Err(HarvestError::validation("governor.burst must be > 0"));
        }
        if self.ceiling_delay_ms < self.floor_delay_ms {
            return Err(HarvestError::validation(
                "governor.ceiling_delay_ms must be >= floor_delay_ms",
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(HarvestError::validation(
                "governor.recovery_threshold must be > 0",
            ));
        }
        if !(self.recovery_factor.is_finite() && self.recovery_factor > 1.0) {
            return Err(HarvestError::validation(
                "governor.recovery_factor must be > 1.0",
            ));
        }
        Ok(())
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            target_rate: defaults::target_rate(),
            burst: defaults::burst(),
            backoff: BackoffPolicy::default(),
            floor_delay_ms: defaults::floor_delay(),
            ceiling_delay_ms: defaults::ceiling_delay(),
            linear_step_ms: defaults::linear_step(),
            recovery_threshold: defaults::recovery_threshold(),
            recovery_factor: defaults::recovery_factor(),
        }
    }
}

/// Durable queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// SQLite database file shared by ledger and tracker
    #[serde(default = "defaults::database_path")]
    pub database_path: PathBuf,

    /// Retry budget for items inserted without one
    #[serde(default = "defaults::max_retries")]
    pub default_max_retries: u32,

    /// How long a connection waits on a locked database
    #[serde(default = "defaults::busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: defaults::database_path(),
            default_max_retries: defaults::max_retries(),
            busy_timeout_ms: defaults::busy_timeout(),
        }
    }
}

/// HTTP extractor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            connect_timeout_secs: defaults::connect_timeout(),
        }
    }
}

/// Payload sink settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory for JSON payloads; payloads are discarded when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Harvest defaults
    pub fn worker_count() -> usize {
        4
    }
    pub fn batch_size() -> usize {
        10
    }
    pub fn extract_timeout() -> u64 {
        30
    }
    pub fn staleness_timeout() -> u64 {
        15 * 60
    }
    pub fn max_claim_errors() -> u32 {
        5
    }

    // Governor defaults
    pub fn target_rate() -> f64 {
        1.0
    }
    pub fn burst() -> u32 {
        1
    }
    pub fn floor_delay() -> u64 {
        1_000
    }
    pub fn ceiling_delay() -> u64 {
        120_000
    }
    pub fn linear_step() -> u64 {
        2_000
    }
    pub fn recovery_threshold() -> u32 {
        20
    }
    pub fn recovery_factor() -> f64 {
        1.5
    }

    // Ledger defaults
    pub fn database_path() -> PathBuf {
        PathBuf::from("storage/harvest.db")
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn busy_timeout() -> u64 {
        5_000
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; harvester/0.1)".into()
    }
    pub fn connect_timeout() -> u64 {
        10
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.harvest.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let mut config = Config::default();
        config.governor.floor_delay_ms = 10_000;
        config.governor.ceiling_delay_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_rate() {
        let mut config = Config::default();
        config.governor.target_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [harvest]
            worker_count = 8
            partition = "2024"

            [governor]
            target_rate = 2.5
            backoff = "linear"
            "#,
        )
        .unwrap();

        assert_eq!(config.harvest.worker_count, 8);
        assert_eq!(config.harvest.batch_size, 10);
        assert_eq!(config.harvest.partition.as_deref(), Some("2024"));
        assert_eq!(config.governor.backoff, BackoffPolicy::Linear);
        assert_eq!(config.governor.burst, 1);
        assert_eq!(config.ledger.default_max_retries, 3);
    }

    #[test]
    fn load_or_default_falls_back_on_missing_file() {
        let config = Config::load_or_default("/nonexistent/harvester.toml");
        assert_eq!(config.harvest.worker_count, 4);
    }
}
