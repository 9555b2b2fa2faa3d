//! Change feed source and connection contracts.

use crate::error::BoxError;
use crate::event::{ChangeEvent, FeedFilter, FeedOptions};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Opens change feeds positioned by [`FeedOptions`].
#[async_trait]
pub trait ChangeFeedSource<T>: Send + Sync {
    /// Open a feed yielding the events admitted by `filter`, starting after
    /// the position named in `options` (or from the beginning).
    async fn open(
        &self,
        filter: &FeedFilter,
        options: &FeedOptions,
    ) -> Result<Box<dyn ChangeFeed<T>>, BoxError>;
}

/// A lazy, ordered, restartable sequence of change events.
#[async_trait]
pub trait ChangeFeed<T>: Send {
    /// Wait for the next event.
    ///
    /// `Ok(None)` means the feed ended (invalidated or expired) and will not
    /// produce anything else. An `Err` is terminal as well. Must be
    /// cancel-safe: dropping the future must not lose a buffered event.
    async fn next(&mut self) -> Result<Option<ChangeEvent<T>>, BoxError>;

    /// Release the feed. Best effort; the runner ignores failures.
    async fn close(&mut self) -> Result<(), BoxError>;
}

/// Lifecycle signal emitted by the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connecting,
    Connected,
    Closed,
    Error(String),
}

/// The database connection the feeds are opened on.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribe to lifecycle signals.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal>;

    /// Close the connection. With `force`, in-flight operations are abandoned.
    ///
    /// Implementations broadcast [`ConnectionSignal::Closed`] before returning.
    async fn close(&self, force: bool) -> Result<(), BoxError>;
}
