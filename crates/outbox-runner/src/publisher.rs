//! Publish sink contract.

use crate::error::BoxError;
use crate::event::ChangeEvent;
use async_trait::async_trait;

/// Delivers one change event to the outside world.
///
/// The runner guarantees at-least-once delivery: the same event may be
/// published again after a restart, so implementations must tolerate
/// re-delivery (idempotent consumers, dedupe keys, ...).
#[async_trait]
pub trait Publisher<T>: Send + Sync {
    /// Publish `event`. An error makes the runner restart from the last
    /// persisted checkpoint.
    async fn publish(&self, event: &ChangeEvent<T>) -> Result<(), BoxError>;
}
