//! Outbox document shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row written to the outbox collection by the producing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxDocument {
    /// Event name, e.g. `orders.created`.
    pub event: String,
    /// Arbitrary event body.
    #[serde(default)]
    pub payload: Value,
    /// When the producer recorded the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}
