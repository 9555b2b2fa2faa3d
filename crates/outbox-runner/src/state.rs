//! Runner status axes.

use serde::Serialize;

/// Status of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Closed,
}

/// Status of the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Connecting,
    Running,
    Restarting,
    Closed,
}

/// Snapshot of both status axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub connection: ConnectionStatus,
    pub feed: FeedStatus,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            connection: ConnectionStatus::Connecting,
            feed: FeedStatus::Connecting,
        }
    }
}

impl Health {
    /// True while a feed is open and delivering.
    pub fn is_running(&self) -> bool {
        self.feed == FeedStatus::Running
    }
}
