//! Runner configuration.

use crate::checkpoint::CheckpointStore;
use crate::event::{CheckpointToken, FeedOptions};
use crate::publisher::Publisher;
use crate::source::{ChangeFeedSource, Connection};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Fixed delay between a failure and the next attempt.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Events read from the feed ahead of delivery before reading pauses.
pub const DEFAULT_READ_AHEAD: usize = 64;

/// Which resume position wins when the caller's feed options name one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumePrecedence {
    /// Caller feed options are applied last and replace the persisted
    /// checkpoint.
    #[default]
    CallerOptions,
    /// The persisted checkpoint replaces any caller resume position.
    Checkpoint,
}

/// Immutable runner configuration.
pub struct RunnerConfig<T> {
    /// Opens change feeds.
    pub source: Arc<dyn ChangeFeedSource<T>>,
    /// Connection the feeds run on; closed by `stop()`.
    pub connection: Arc<dyn Connection>,
    /// Durable progress.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Where events go.
    pub publisher: Arc<dyn Publisher<T>>,
    /// Caller predicate, AND-ed with "operation kind = insert".
    pub filter: Map<String, Value>,
    /// Caller feed options, merged over the computed resume position.
    pub feed_options: FeedOptions,
    /// Backoff before each restart.
    pub restart_delay: Duration,
    /// Resume position precedence.
    pub resume_precedence: ResumePrecedence,
    /// Most events waiting for delivery; the feed is not read past it.
    pub read_ahead: usize,
}

impl<T> RunnerConfig<T> {
    /// Create a configuration with an empty filter and default options.
    pub fn new(
        source: Arc<dyn ChangeFeedSource<T>>,
        connection: Arc<dyn Connection>,
        checkpoints: Arc<dyn CheckpointStore>,
        publisher: Arc<dyn Publisher<T>>,
    ) -> Self {
        Self {
            source,
            connection,
            checkpoints,
            publisher,
            filter: Map::new(),
            feed_options: FeedOptions::default(),
            restart_delay: DEFAULT_RESTART_DELAY,
            resume_precedence: ResumePrecedence::default(),
            read_ahead: DEFAULT_READ_AHEAD,
        }
    }

    /// Set the caller predicate.
    pub fn with_filter(mut self, filter: Map<String, Value>) -> Self {
        self.filter = filter;
        self
    }

    /// Set the caller feed options.
    pub fn with_feed_options(mut self, options: FeedOptions) -> Self {
        self.feed_options = options;
        self
    }

    /// Set the restart backoff.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Set the read-ahead limit. At least one event is always read ahead.
    pub fn with_read_ahead(mut self, limit: usize) -> Self {
        self.read_ahead = limit.max(1);
        self
    }

    /// Set the resume precedence.
    pub fn with_resume_precedence(mut self, precedence: ResumePrecedence) -> Self {
        self.resume_precedence = precedence;
        self
    }

    /// Build the options used to open a feed from the persisted checkpoint.
    pub fn feed_options_for(&self, checkpoint: Option<CheckpointToken>) -> FeedOptions {
        let computed = FeedOptions::resume_from(checkpoint.clone());

        match self.resume_precedence {
            ResumePrecedence::CallerOptions => {
                let merged = computed.merged_with(&self.feed_options);
                if checkpoint.is_some() && merged.resume_position() != checkpoint.as_ref() {
                    warn!(
                        checkpoint = ?checkpoint,
                        resume_position = ?merged.resume_position(),
                        "Caller feed options override the persisted checkpoint"
                    );
                }
                merged
            }
            ResumePrecedence::Checkpoint => {
                let mut merged = computed.merged_with(&self.feed_options);
                if checkpoint.is_some() {
                    merged.resume_after = checkpoint;
                    merged.start_after = None;
                }
                merged
            }
        }
    }
}
