// src/lib.rs

//! Harvester Library
//!
//! Durable, rate-limited, concurrent harvesting over a shared work ledger.

pub mod db;
pub mod error;
pub mod extractor;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod sink;
pub mod tracker;
pub mod utils;
