//! Outbox runner error types.

use crate::queue::UnitPanic;
use thiserror::Error;

/// Boxed error returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outbox runner error type.
///
/// Every failure variant except `AlreadyStarted` and `Stopped` is recovered
/// the same way: pending deliveries are discarded, the feed is closed and the
/// runner restarts from the last persisted checkpoint.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Error reported by the underlying connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Terminal change feed failure (open or read)
    #[error("Change feed error: {0}")]
    Feed(#[source] BoxError),

    /// The publish sink rejected an event
    #[error("Publish failed: {0}")]
    Publish(#[source] BoxError),

    /// The checkpoint store failed to read or persist a position
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] BoxError),

    /// A publisher or checkpoint store panicked mid-delivery
    #[error("Delivery failed: {0}")]
    Panicked(#[from] UnitPanic),

    /// `start()` was called while the runner is already running
    #[error("Runner already started")]
    AlreadyStarted,

    /// The runner was stopped; a stopped runner cannot be restarted
    #[error("Runner stopped")]
    Stopped,
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
