// src/models/mod.rs

//! Domain models for the harvest engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod session;
mod work_item;

// Re-export all public types
pub use config::{
    BackoffPolicy, Config, GovernorConfig, HarvestConfig, HttpConfig, LedgerConfig,
    LoggingConfig, SinkConfig,
};
pub use session::{ErrorClass, ErrorDetail, ErrorRecord, Session};
pub use work_item::{
    ItemError, LedgerStats, NewWorkItem, StatusCounts, Transition, WorkItem, WorkStatus,
};
