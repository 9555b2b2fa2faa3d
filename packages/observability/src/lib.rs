//! # Observability
//!
//! Logging setup shared by the outbox relay binaries.
//!
//! Services call [`init`] or [`init_with_config`] once at startup and use
//! the standard `tracing` macros everywhere else. Where the lines end up is
//! decided here:
//!
//! - no `log_path`: compact human-readable lines on stderr
//! - with `log_path`: one JSON object per line appended to that file, with an
//!   optional compact copy on stderr
//!
//! `RUST_LOG` overrides the configured default level in both modes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() -> Result<(), observability::ObservabilityError> {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "outbox-relay".into(),
//!         log_path: observability::default_log_path("outbox-relay"),
//!         also_stderr: true,
//!         ..Default::default()
//!     })?;
//!
//!     tracing::info!("relay started");
//!     Ok(())
//! }
//! ```

mod json_layer;
mod writer;

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::FileLogWriter;

/// Errors raised while installing the subscriber.
#[derive(Error, Debug)]
pub enum ObservabilityError {
    /// The log file could not be opened
    #[error("failed to open log file: {0}")]
    Io(#[from] io::Error),

    /// A global subscriber is already installed
    #[error("failed to install subscriber: {0}")]
    Init(String),
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every JSON line.
    pub service_name: String,

    /// Default level filter (e.g. "debug", "info").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// JSONL file to append to. Logs go to stderr only when unset.
    pub log_path: Option<PathBuf>,

    /// Also emit compact lines to stderr when writing to a file.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Conventional JSONL location for a service:
/// `<data-local-dir>/outbox-relay/logs/<service>.jsonl`.
pub fn default_log_path(service_name: &str) -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| {
        dir.join("outbox-relay")
            .join("logs")
            .join(format!("{}.jsonl", service_name))
    })
}

/// Initialize logging with default settings.
pub fn init(service_name: &str) -> Result<(), ObservabilityError> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Fails when the log file cannot be opened or when a global subscriber was
/// already installed.
pub fn init_with_config(config: LogConfig) -> Result<(), ObservabilityError> {
    let Some(log_path) = config.log_path.clone() else {
        return tracing_subscriber::fmt()
            .with_env_filter(env_filter(&config.default_level))
            .with_target(true)
            .with_writer(io::stderr)
            .compact()
            .try_init()
            .map_err(|e| ObservabilityError::Init(e.to_string()));
    };

    let writer = FileLogWriter::open(&log_path)?;
    let json_layer = JsonLayer::new(config.service_name.clone(), writer)
        .with_filter(env_filter(&config.default_level));

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| ObservabilityError::Init(e.to_string()))?;

    tracing::info!(log_path = %log_path.display(), "observability initialized");
    Ok(())
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros so services can use `observability::info!()`.
pub use tracing::{debug, error, info, instrument, trace, warn};

pub use tracing::Level;
