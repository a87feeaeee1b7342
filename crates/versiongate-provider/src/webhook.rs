//! Incoming-webhook messenger

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{Messenger, OutboundMessage, ProviderError, ProviderResult};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts messages as JSON to a webhook URL; only logs when no URL is set
pub struct WebhookMessenger {
    client: Client,
    url: Option<String>,
}

impl WebhookMessenger {
    pub fn new(url: Option<String>) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .connect_timeout(SEND_TIMEOUT)
            .build()?;

        if url.is_none() {
            info!("No webhook configured; outbound messages will only be logged");
        }

        Ok(Self { client, url })
    }

    pub fn is_log_only(&self) -> bool {
        self.url.is_none()
    }
}

#[async_trait]
impl Messenger for WebhookMessenger {
    async fn send(&self, message: &OutboundMessage) -> ProviderResult<()> {
        let Some(url) = &self.url else {
            info!(
                kind = ?message.kind,
                recipient = %message.recipient,
                serial = ?message.serial,
                text = %message.text,
                "Message (log only)"
            );
            return Ok(());
        };

        let body = serde_json::to_string(message)?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, recipient = %message.recipient, "Webhook rejected message");
            return Err(ProviderError::Http(format!("webhook returned {status}")));
        }

        debug!(kind = ?message.kind, recipient = %message.recipient, "Message delivered");
        Ok(())
    }
}
