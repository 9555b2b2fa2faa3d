//! Runner observability events.
//!
//! Handlers are registered per [`EventKind`] and invoked synchronously, in
//! registration order, on the task that emits the event. A handler that
//! panics is logged and skipped; it cannot abort delivery or starve the
//! handlers registered after it.

use crate::error::OutboxError;
use crate::event::{ChangeEvent, CheckpointToken, FeedFilter, FeedOptions};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Closed set of event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Close,
    Error,
    Running,
    Restarting,
    Change,
    Committed,
}

impl EventKind {
    /// All event kinds, in declaration order.
    pub const ALL: [EventKind; 7] = [
        EventKind::Connected,
        EventKind::Close,
        EventKind::Error,
        EventKind::Running,
        EventKind::Restarting,
        EventKind::Change,
        EventKind::Committed,
    ];

    /// Event name as exposed to subscribers.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Close => "close",
            EventKind::Error => "error",
            EventKind::Running => "running",
            EventKind::Restarting => "restarting",
            EventKind::Change => "change",
            EventKind::Committed => "committed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by the runner, with its payload.
#[derive(Debug)]
pub enum RunnerEvent<T> {
    /// The connection is ready.
    Connected,
    /// The connection closed.
    Close,
    /// A connection, feed, publish or checkpoint failure.
    Error(Arc<OutboxError>),
    /// A feed was opened with this filter and these options.
    Running {
        filter: FeedFilter,
        options: FeedOptions,
    },
    /// The feed is being torn down and will be reopened after the backoff.
    Restarting,
    /// An event is about to be published.
    Change(Arc<ChangeEvent<T>>),
    /// An event was published and its position persisted.
    Committed(CheckpointToken),
}

impl<T> RunnerEvent<T> {
    /// Tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            RunnerEvent::Connected => EventKind::Connected,
            RunnerEvent::Close => EventKind::Close,
            RunnerEvent::Error(_) => EventKind::Error,
            RunnerEvent::Running { .. } => EventKind::Running,
            RunnerEvent::Restarting => EventKind::Restarting,
            RunnerEvent::Change(_) => EventKind::Change,
            RunnerEvent::Committed(_) => EventKind::Committed,
        }
    }
}

/// A subscriber callback.
pub type Handler<T> = Arc<dyn Fn(&RunnerEvent<T>) + Send + Sync>;

/// Typed registry of handler lists keyed by event kind.
pub struct EventBus<T> {
    handlers: RwLock<Vec<(EventKind, Handler<T>)>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<T> EventBus<T> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&RunnerEvent<T>) + Send + Sync + 'static,
    {
        self.handlers.write().push((kind, Arc::new(handler)));
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .iter()
            .filter(|(registered, _)| *registered == kind)
            .count()
    }

    /// Dispatch `event` to its handlers.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe
    /// further handlers without deadlocking; those only see later events.
    pub fn emit(&self, event: &RunnerEvent<T>) {
        let kind = event.kind();
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .iter()
            .filter(|(registered, _)| *registered == kind)
            .map(|(_, handler)| handler.clone())
            .collect();

        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(
                    event = %kind,
                    handler_index = index,
                    "Event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }
}
