// src/notify/webhook.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{DeliveryChannel, RenderedItem};
use crate::error::{PipelineError, Result};

/// Webhook delivery (Discord-compatible embed payload). One HTTP POST per
/// item; the dispatcher paces and retries around this.
#[derive(Clone)]
pub struct WebhookChannel {
    client: Client,
    timeout: Duration,
}

impl WebhookChannel {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn send(&self, address: &str, item: &RenderedItem) -> Result<()> {
        let description = format!(
            "**Category:** {}\n**Confidence:** {}%\n{}",
            item.category, item.confidence, item.link
        );
        let payload = WebhookPayload::embed(&item.title, &description);

        let rsp = self
            .client
            .post(address)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::Delivery(format!("webhook request failed: {e}")))?;

        rsp.error_for_status_ref()
            .map(|_| ())
            .map_err(|e| PipelineError::Delivery(format!("webhook HTTP error: {e}")))
    }

    fn channel_name(&self) -> &'static str {
        "webhook"
    }
}

#[derive(Serialize)]
struct WebhookEmbed {
    title: String,
    description: String,
}

#[derive(Serialize)]
struct WebhookPayload {
    content: Option<String>,
    embeds: Vec<WebhookEmbed>,
}

impl WebhookPayload {
    fn embed(title: &str, description: &str) -> Self {
        Self {
            content: None,
            embeds: vec![WebhookEmbed {
                title: title.to_string(),
                description: description.to_string(),
            }],
        }
    }
}
