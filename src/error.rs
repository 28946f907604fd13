//! Error types for the calendar assistant.
//!
//! Cache and telemetry code never surfaces these: a cache miss is a normal
//! outcome and telemetry failures are swallowed. Everything else (store,
//! backend, tool arguments, config files) reports through [`CalendarError`].

use thiserror::Error;

/// Library-wide error type.
#[derive(Debug, Error)]
pub enum CalendarError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The reasoning backend failed or returned an unusable response.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The event store failed to read or persist.
    #[error("Store error: {0}")]
    Store(String),

    /// A referenced event does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected input (bad time range, empty title, malformed timestamp).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A tool was called with bad arguments or is unknown.
    #[error("Tool error: {0}")]
    Tool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CalendarError>;
