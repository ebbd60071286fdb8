//! Wolfpack Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for wolfpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wolfpack error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Watch history gap at store index {0}")]
    HistoryGap(u64),

    // Election errors
    #[error("Election already started")]
    AlreadyStarted,

    #[error("Election not started")]
    NotStarted,

    #[error("Election stopped while waiting for mastership")]
    Stopped,

    #[error("Withdrawal not confirmed within {0:?}")]
    WithdrawTimeout(Duration),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}
