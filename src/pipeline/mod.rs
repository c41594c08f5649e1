//! Harvest pipeline: pacing, classification and the worker pool.
//!
//! - `governor`: token-bucket pacing shared by every worker
//! - `classify`: extractor outcome to ledger verdict
//! - `orchestrator`: the worker pool driving a run

pub mod classify;
pub mod governor;
pub mod orchestrator;

pub use classify::{Rejection, RetryCause, Verdict, classify};
pub use governor::{RateGovernor, RateState};
pub use orchestrator::{Harvester, RunOptions, RunReport};
