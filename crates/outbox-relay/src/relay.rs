//! Wiring: Redis feed, file checkpoint and publisher behind one runner.

use crate::config::RelayConfig;
use crate::document::OutboxDocument;
use crate::error::RelayResult;
use crate::file_checkpoint::FileCheckpointStore;
use crate::publisher::{HttpPublisher, HttpPublisherConfig, LogPublisher};
use crate::redis_feed::RedisChangeFeedSource;
use outbox_runner::{EventKind, OutboxRunner, Publisher, RunnerConfig, RunnerEvent};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Runner relaying outbox documents.
pub type RelayRunner = OutboxRunner<OutboxDocument>;

/// Assemble a runner from `config`. Does not connect; call `start()`.
pub fn build_runner(config: &RelayConfig) -> RelayResult<RelayRunner> {
    let source = Arc::new(RedisChangeFeedSource::<OutboxDocument>::new(
        &config.redis_url,
        config.stream.clone(),
    )?);
    let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint_path));

    let publisher: Arc<dyn Publisher<OutboxDocument>> = match &config.publish_url {
        Some(url) => Arc::new(HttpPublisher::new(HttpPublisherConfig {
            url: url.clone(),
            token: config.publish_token.clone(),
            timeout: config.publish_timeout,
        })?),
        None => {
            warn!("PUBLISH_URL not set, outbox events will only be logged");
            Arc::new(LogPublisher)
        }
    };

    let runner_config = RunnerConfig::<OutboxDocument>::new(source.clone(), source, checkpoints, publisher)
        .with_filter(config.filter.clone())
        .with_feed_options(config.feed_options())
        .with_restart_delay(config.restart_delay)
        .with_read_ahead(config.read_ahead);

    let runner = OutboxRunner::new(runner_config);
    attach_log_handlers(&runner);
    Ok(runner)
}

/// Log every runner event.
pub fn attach_log_handlers(runner: &RelayRunner) {
    for kind in EventKind::ALL {
        runner.on(kind, log_event);
    }
}

fn log_event(event: &RunnerEvent<OutboxDocument>) {
    match event {
        RunnerEvent::Connected => info!("Connected to Redis"),
        RunnerEvent::Close => info!("Redis connection closed"),
        RunnerEvent::Error(err) => error!(error = %err, "Outbox relay error"),
        RunnerEvent::Running { filter, options } => info!(
            operation_type = filter.operation_type().as_str(),
            predicate = %serde_json::Value::Object(filter.predicate().clone()),
            resume_after = ?options.resume_after,
            "Change feed running"
        ),
        RunnerEvent::Restarting => warn!("Change feed restarting"),
        RunnerEvent::Change(change) => debug!(
            position = %change.id,
            event = %change.full_document.event,
            "Relaying outbox event"
        ),
        RunnerEvent::Committed(token) => debug!(position = %token, "Checkpoint committed"),
    }
}
