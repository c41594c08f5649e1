// src/error.rs

//! Unified error handling for the harvest engine.

use std::fmt;

use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client construction failed
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite engine error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A blocking storage task panicked or was cancelled
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Storage layer returned data it cannot interpret
    #[error("Storage error: {0}")]
    Storage(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown session handle
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already closed; aggregates are frozen
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// Payload sink failed to persist a result
    #[error("Sink error for {item_id}: {message}")]
    Sink { item_id: String, message: String },
}

impl HarvestError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a sink error with the affected item.
    pub fn sink(item_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Sink {
            item_id: item_id.into(),
            message: message.to_string(),
        }
    }
}
