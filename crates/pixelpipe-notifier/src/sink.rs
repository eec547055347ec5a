//! Notification sinks
//!
//! A sink is one place an event gets relayed to. The fanout treats every
//! sink the same: best-effort, failure logged and skipped. Sinks must
//! tolerate duplicate events, since queue delivery is at-least-once.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use pixelpipe_common::types::{EventEnvelope, ImageStatus};

use crate::error::{NotifierError, NotifierResult};

/// One delivery target for pipeline events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Stable name, used in logs when delivery fails.
    fn name(&self) -> &str;

    async fn deliver(&self, event: &EventEnvelope) -> NotifierResult<()>;
}

/// Emits each event as a structured log line. Always configured; the
/// operator-facing baseline when no webhooks are set up.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &EventEnvelope) -> NotifierResult<()> {
        match event.status {
            ImageStatus::Completed => info!(
                image_id = %event.image_id,
                processed_url = event.processed_url.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            _ => info!(
                image_id = %event.image_id,
                status = %event.status,
                error = event.error.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a configured endpoint.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String, timeout: Duration) -> NotifierResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, event: &EventEnvelope) -> NotifierResult<()> {
        let response = self.client.post(&self.url).json(event).send().await?;

        if !response.status().is_success() {
            return Err(NotifierError::Sink(format!(
                "{} responded {}",
                self.url,
                response.status()
            )));
        }

        Ok(())
    }
}
