//! Harvester CLI
//!
//! Local execution entry point: queue management and harvest runs against a
//! SQLite ledger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use harvester::{
    db::Database,
    error::{HarvestError, Result},
    extractor::HttpExtractor,
    ledger::{SqliteLedger, WorkLedger},
    models::{Config, NewWorkItem, StatusCounts},
    pipeline::{Harvester, RateGovernor, RunOptions},
    sink::{JsonDirSink, NullSink, PayloadSink},
    tracker::{SessionTracker, SqliteTracker},
    utils,
};
use tokio_util::sync::CancellationToken;

/// Harvester - durable, rate-limited document harvesting
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Durable, rate-limited, concurrent document harvester"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "harvester.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drain the ledger with a pool of workers
    Run {
        /// Override harvest.worker_count
        #[arg(long)]
        workers: Option<usize>,

        /// Override harvest.batch_size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after claiming this many batches
        #[arg(long)]
        max_batches: Option<usize>,

        /// Only harvest items in this partition
        #[arg(long)]
        partition: Option<String>,

        /// Sweep claims older than harvest.staleness_timeout_secs first
        #[arg(long)]
        reclaim_stale: bool,
    },

    /// Insert items from a JSON array of work items
    Enqueue {
        /// JSON file containing `[{"item_id", "partition_key", "source_locator", ...}]`
        file: PathBuf,
    },

    /// Return abandoned claims to Pending
    Reclaim {
        /// Claim age threshold (default: harvest.staleness_timeout_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Show ledger counts per status and partition
    Stats,

    /// Show the most recent error records
    Errors {
        /// Only errors from this session
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag and configured level.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn open_database(config: &Config) -> Result<Database> {
    Database::open(
        &config.ledger.database_path,
        Duration::from_millis(config.ledger.busy_timeout_ms),
    )
}

fn format_counts(counts: &StatusCounts) -> String {
    format!(
        "pending={} claimed={} completed={} failed={} invalid={} (total {})",
        counts.pending,
        counts.claimed,
        counts.completed,
        counts.failed,
        counts.invalid,
        counts.total()
    )
}

/// Cancel `token` on Ctrl-C so workers drain gracefully.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, finishing in-flight items...");
            token.cancel();
        }
    });
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = Config::load(&cli.config);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    let config = loaded.unwrap_or_else(|e| {
        log::warn!(
            "Config load failed from {}: {}. Using defaults.",
            cli.config.display(),
            e
        );
        Config::default()
    });

    match cli.command {
        Command::Run {
            workers,
            batch_size,
            max_batches,
            partition,
            reclaim_stale,
        } => {
            config.validate()?;
            let db = open_database(&config)?;
            let ledger: Arc<dyn WorkLedger> = Arc::new(SqliteLedger::new(
                db.clone(),
                config.ledger.default_max_retries,
            ));
            let tracker: Arc<dyn SessionTracker> = Arc::new(SqliteTracker::new(db));
            let governor = Arc::new(RateGovernor::with_config(config.governor.clone()));
            let extractor = Arc::new(HttpExtractor::new(&config.http)?);
            let sink: Arc<dyn PayloadSink> = match &config.sink.output_dir {
                Some(dir) => Arc::new(JsonDirSink::new(dir)),
                None => Arc::new(NullSink),
            };

            let mut options = RunOptions::from(&config.harvest);
            options.worker_count = workers.unwrap_or(options.worker_count);
            options.batch_size = batch_size.unwrap_or(options.batch_size);
            options.max_batches = max_batches.or(options.max_batches);
            options.partition = partition.or(options.partition);
            if reclaim_stale {
                options.reclaim_stale_after = Some(config.harvest.staleness_timeout());
            }

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let harvester = Harvester::new(ledger, tracker, governor, extractor).with_sink(sink);
            let report = harvester.run(options, cancel).await?;

            for failure in &report.worker_errors {
                log::error!("{}", failure);
            }
            if report.cancelled {
                log::warn!("Run interrupted; released items will be picked up next run");
            }
        }

        Command::Enqueue { file } => {
            let content = tokio::fs::read_to_string(&file).await?;
            let items: Vec<NewWorkItem> = serde_json::from_str(&content)?;
            if let Some(bad) = items
                .iter()
                .find(|i| i.item_id.is_empty() || i.partition_key.is_empty())
            {
                return Err(HarvestError::validation(format!(
                    "item with empty id or partition: {:?}",
                    bad
                )));
            }

            let ledger = SqliteLedger::new(
                open_database(&config)?,
                config.ledger.default_max_retries,
            );
            let inserted = ledger.insert_items(&items).await?;
            log::info!(
                "Enqueued {} new items ({} already present) from {}",
                inserted,
                items.len() - inserted,
                file.display()
            );
        }

        Command::Reclaim { older_than_secs } => {
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.harvest.staleness_timeout());
            let ledger = SqliteLedger::new(
                open_database(&config)?,
                config.ledger.default_max_retries,
            );
            let reclaimed = ledger.reclaim_stale(older_than).await?;
            log::info!(
                "Reclaimed {} claims older than {}",
                reclaimed,
                utils::format_elapsed(older_than)
            );
        }

        Command::Stats => {
            let db = open_database(&config)?;
            utils::log::header(&format!("Ledger {}", db.path().display()));

            let ledger = SqliteLedger::new(db, config.ledger.default_max_retries);
            let stats = ledger.stats().await?;

            utils::log::sub_item(&format!("all: {}", format_counts(&stats.totals)));
            for (partition, counts) in &stats.by_partition {
                utils::log::sub_item(&format!("{}: {}", partition, format_counts(counts)));
            }
        }

        Command::Errors { session, limit } => {
            let tracker = SqliteTracker::new(open_database(&config)?);
            if let Some(session_id) = &session {
                match tracker.session(session_id).await? {
                    Some(s) => utils::log::summary(
                        &format!("Session {}", s.session_id),
                        &[
                            ("started", s.started_at.to_rfc3339()),
                            (
                                "ended",
                                s.ended_at
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| "running".to_string()),
                            ),
                            ("attempted", s.attempted.to_string()),
                            ("succeeded", s.succeeded.to_string()),
                            ("failed", s.failed.to_string()),
                        ],
                    ),
                    None => return Err(HarvestError::SessionNotFound(session_id.clone())),
                }
            }

            let records = tracker.recent_errors(session.as_deref(), limit).await?;
            if records.is_empty() {
                log::info!("No errors recorded.");
            }
            for record in records {
                utils::log::sub_item(&format!(
                    "{} {} [{}/{}] attempt {}: {}",
                    record.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                    record.item_id,
                    record.error_class,
                    record.error_code,
                    record.retry_attempt,
                    record.message
                ));
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("✓ Config OK");
        }
    }

    Ok(())
}
