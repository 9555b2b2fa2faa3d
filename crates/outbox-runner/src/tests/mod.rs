//! Integration tests for the outbox runner.
//!
//! - `harness.rs`          - Mock change log, publisher, checkpoint store
//! - `ordering.rs`         - Ordered, one-at-a-time delivery
//! - `read_ahead.rs`       - Bounded reading ahead of delivery
//! - `failure_recovery.rs` - Publish/checkpoint/feed failures and redelivery
//! - `feed_end.rs`         - Feed ending without an error
//! - `options.rs`          - Filter and resume position computation
//! - `lifecycle.rs`        - start/stop semantics
//! - `health.rs`           - Connection and feed status reporting
//! - `handlers.rs`         - Subscriber registration and isolation

mod handlers;
pub(crate) mod harness;
