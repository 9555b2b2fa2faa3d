//! Configuration for the outbox relay.

use crate::error::{RelayError, RelayResult};
use outbox_runner::{FeedOptions, DEFAULT_READ_AHEAD, DEFAULT_RESTART_DELAY};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Outbox relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Key of the stream carrying the outbox change feed
    pub stream: String,

    /// Caller predicate applied to the feed (JSON object)
    pub filter: Map<String, Value>,

    /// File holding the last committed stream position
    pub checkpoint_path: PathBuf,

    /// Endpoint events are POSTed to; events are only logged when unset
    pub publish_url: Option<String>,

    /// Bearer token sent to the publish endpoint
    pub publish_token: Option<String>,

    /// Per-request publish timeout
    pub publish_timeout: Duration,

    /// Backoff before reopening a failed feed
    pub restart_delay: Duration,

    /// Entries fetched per XREAD
    pub batch_size: u32,

    /// XREAD block timeout in milliseconds
    pub block_ms: u64,

    /// Events held in memory ahead of delivery
    pub read_ahead: usize,
}

impl RelayConfig {
    /// Build the configuration from environment variables, with defaults.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let stream = lookup("OUTBOX_STREAM").unwrap_or_else(|| "outbox:changes".to_string());

        let filter = match lookup("OUTBOX_FILTER") {
            Some(raw) => parse_filter(&raw)?,
            None => Map::new(),
        };

        let checkpoint_path = lookup("CHECKPOINT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("outbox-checkpoint.json"));

        let publish_url = lookup("PUBLISH_URL").filter(|s| !s.is_empty());
        let publish_token = lookup("PUBLISH_TOKEN").filter(|s| !s.is_empty());

        let publish_timeout_secs: u64 = lookup("PUBLISH_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let restart_delay = lookup("RESTART_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RESTART_DELAY);

        let batch_size: u32 = lookup("OUTBOX_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let block_ms: u64 = lookup("OUTBOX_BLOCK_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let read_ahead: usize = lookup("OUTBOX_READ_AHEAD")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_READ_AHEAD);

        Ok(Self {
            redis_url,
            stream,
            filter,
            checkpoint_path,
            publish_url,
            publish_token,
            publish_timeout: Duration::from_secs(publish_timeout_secs),
            restart_delay,
            batch_size,
            block_ms,
            read_ahead,
        })
    }

    /// Feed tuning derived from this configuration.
    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            batch_size: Some(self.batch_size),
            max_await_time: Some(Duration::from_millis(self.block_ms)),
            ..Default::default()
        }
    }
}

/// Parse a JSON object predicate such as `{"fullDocument.event": "orders.created"}`.
pub fn parse_filter(raw: &str) -> RelayResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(RelayError::Config(format!(
            "OUTBOX_FILTER must be a JSON object, got {}",
            other
        ))),
    }
}
