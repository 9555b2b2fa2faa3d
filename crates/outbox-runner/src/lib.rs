//! Outbox runner: ordered, at-least-once relay of a database change feed.
//!
//! The runner tails the insert events of a change feed, hands each one to a
//! [`Publisher`], and persists the event's position through a
//! [`CheckpointStore`] once publishing succeeded. After a crash or a feed
//! failure it resumes from the last persisted position.
//!
//! # Core Invariants
//!
//! 1. **Ordered**: events are published and committed in feed order
//! 2. **One In-Flight**: at most one delivery runs at a time
//! 3. **Commit-After-Publish**: a position is persisted only after its event
//!    was published, and only after every earlier event was committed
//! 4. **Self-Healing**: any delivery or feed failure discards undelivered
//!    work and reopens the feed from the checkpoint after a fixed delay
//!
//! # Architecture
//!
//! ```text
//! Change feed -> Runner -> DeliveryQueue -> Publisher
//!      ^                        |
//!      |___ resume <- Checkpoint store
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod events;
pub mod publisher;
pub mod queue;
pub mod runner;
pub mod source;
pub mod state;

#[cfg(test)]
mod tests;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use config::{ResumePrecedence, RunnerConfig, DEFAULT_READ_AHEAD, DEFAULT_RESTART_DELAY};
pub use error::{BoxError, OutboxError, OutboxResult};
pub use event::{
    ChangeEvent, CheckpointToken, FeedFilter, FeedOptions, Namespace, OperationType,
};
pub use events::{EventBus, EventKind, RunnerEvent};
pub use publisher::Publisher;
pub use queue::{DeliveryQueue, DeliveryUnit, UnitPanic};
pub use runner::OutboxRunner;
pub use source::{ChangeFeed, ChangeFeedSource, Connection, ConnectionSignal};
pub use state::{ConnectionStatus, FeedStatus, Health};
