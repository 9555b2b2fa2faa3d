//! Error types for the outbox relay.

use thiserror::Error;

/// Outbox relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error (checkpoint file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unexpected stream reply or undecodable entry
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The publish endpoint rejected an event
    #[error("Publish rejected: {0}")]
    Rejected(String),

    /// The connection was closed by `stop()`
    #[error("Connection closed")]
    Closed,

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(#[from] observability::ObservabilityError),

    /// Runner lifecycle error
    #[error(transparent)]
    Runner(#[from] outbox_runner::OutboxError),
}

/// Result type alias using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
