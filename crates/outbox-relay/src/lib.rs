//! Outbox relay: tails a Redis stream of outbox inserts and delivers each
//! one, in order, to an HTTP endpoint.
//!
//! Producers append one entry per outbox change to a stream:
//!
//! ```text
//! XADD outbox:changes * operationType insert db shop coll outbox \
//!     fullDocument '{"event":"orders.created","payload":{"orderId":7}}'
//! ```
//!
//! The relay reads the stream from the last committed entry ID, POSTs each
//! document, and records the entry ID in a checkpoint file once the endpoint
//! accepted it. Any failure restarts the feed from that checkpoint, so
//! receivers see every event at least once and in stream order.
//!
//! # Architecture
//!
//! ```text
//! Redis stream -> RedisChangeFeed -> OutboxRunner -> HttpPublisher
//!                                         |
//!                                  FileCheckpointStore
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod file_checkpoint;
pub mod publisher;
pub mod redis_feed;
pub mod relay;

pub use config::{parse_filter, RelayConfig};
pub use document::OutboxDocument;
pub use error::{RelayError, RelayResult};
pub use file_checkpoint::FileCheckpointStore;
pub use publisher::{HttpPublisher, HttpPublisherConfig, LogPublisher};
pub use redis_feed::{RedisChangeFeed, RedisChangeFeedSource};
pub use relay::{attach_log_handlers, build_runner, RelayRunner};
