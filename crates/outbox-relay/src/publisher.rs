//! Publish sinks: HTTP delivery and logging.

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use outbox_runner::{BoxError, ChangeEvent, Publisher};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Header carrying the event position; stable across redeliveries.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header carrying a fresh ID per delivery attempt.
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";

/// HTTP publisher configuration.
#[derive(Debug, Clone)]
pub struct HttpPublisherConfig {
    /// Endpoint each event is POSTed to.
    pub url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
}

/// POSTs each change event as JSON.
///
/// A single attempt per call: a failed delivery surfaces as an error and the
/// runner redelivers after restarting. Receivers should deduplicate on the
/// `Idempotency-Key` header.
pub struct HttpPublisher {
    config: HttpPublisherConfig,
    client: Client,
}

impl HttpPublisher {
    /// Create a publisher with its own HTTP client.
    pub fn new(config: HttpPublisherConfig) -> RelayResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    async fn send<T: Serialize + Sync>(&self, event: &ChangeEvent<T>) -> RelayResult<()> {
        let delivery_id = Uuid::new_v4();

        debug!(
            url = %self.config.url,
            position = %event.id,
            delivery_id = %delivery_id,
            "Publishing event"
        );

        let mut request = self
            .client
            .post(&self.config.url)
            .header(IDEMPOTENCY_KEY_HEADER, event.id.to_string())
            .header(DELIVERY_ID_HEADER, delivery_id.to_string())
            .json(event);

        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        Ok(())
    }
}

#[async_trait]
impl<T> Publisher<T> for HttpPublisher
where
    T: Serialize + Send + Sync + 'static,
{
    async fn publish(&self, event: &ChangeEvent<T>) -> Result<(), BoxError> {
        Ok(self.send(event).await?)
    }
}

/// Logs each change event instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl<T> Publisher<T> for LogPublisher
where
    T: Serialize + Send + Sync + 'static,
{
    async fn publish(&self, event: &ChangeEvent<T>) -> Result<(), BoxError> {
        let document = serde_json::to_string(&event.full_document)?;
        info!(
            position = %event.id,
            ns = %format!("{}.{}", event.ns.db, event.ns.coll),
            document = %document,
            "Outbox event"
        );
        Ok(())
    }
}
