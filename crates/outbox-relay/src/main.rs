//! Outbox relay binary entry point.
//!
//! Usage: outbox-relay [--stream <key>] [--publish-url <url>] [--log-file <path>]
//!
//! Settings not given on the command line are read from the environment
//! (`REDIS_URL`, `OUTBOX_STREAM`, `OUTBOX_FILTER`, `CHECKPOINT_PATH`,
//! `PUBLISH_URL`, `PUBLISH_TOKEN`, `RESTART_DELAY_MS`, ...).

use clap::Parser;
use outbox_relay::{build_runner, parse_filter, RelayConfig, RelayResult};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Outbox relay: ordered, at-least-once delivery of outbox inserts.
#[derive(Parser, Debug)]
#[command(name = "outbox-relay")]
#[command(about = "Relays outbox inserts from a Redis stream to an HTTP endpoint")]
struct Args {
    /// Redis connection URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// Stream key carrying the change feed.
    #[arg(long)]
    stream: Option<String>,

    /// JSON object predicate, e.g. '{"fullDocument.event": "orders.created"}'.
    #[arg(long)]
    filter: Option<String>,

    /// Checkpoint file.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Endpoint events are POSTed to. Events are only logged when unset.
    #[arg(long)]
    publish_url: Option<String>,

    /// Delay before reopening a failed feed, in milliseconds.
    #[arg(long)]
    restart_delay_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append JSONL logs to this file instead of writing to stderr only.
    #[arg(long, env = "OUTBOX_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let args = Args::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "outbox-relay".into(),
        default_level: args.log_level.clone(),
        also_stderr: args.log_file.is_some(),
        log_path: args.log_file.clone(),
    })?;

    info!("Outbox relay starting...");

    let mut config = RelayConfig::from_env()?;

    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(stream) = args.stream {
        config.stream = stream;
    }
    if let Some(raw) = args.filter {
        config.filter = parse_filter(&raw)?;
    }
    if let Some(path) = args.checkpoint {
        config.checkpoint_path = path;
    }
    if let Some(url) = args.publish_url {
        config.publish_url = Some(url);
    }
    if let Some(ms) = args.restart_delay_ms {
        config.restart_delay = Duration::from_millis(ms);
    }

    info!(
        redis_url = %config.redis_url,
        stream = %config.stream,
        checkpoint = %config.checkpoint_path.display(),
        publish_url = config.publish_url.as_deref().unwrap_or("-"),
        restart_delay_ms = config.restart_delay.as_millis() as u64,
        batch_size = config.batch_size,
        block_ms = config.block_ms,
        read_ahead = config.read_ahead,
        "Configuration loaded"
    );

    let runner = build_runner(&config)?;
    runner.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping...");

    runner.stop().await?;
    info!("Outbox relay stopped");

    Ok(())
}
