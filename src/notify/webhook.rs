use super::{Notifier, RunEvent};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!("db-backup-pipeline/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

async fn post_json(client: &Client, url: &str, body: &serde_json::Value) -> Result<()> {
    let response = client.post(url).json(body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(BackupError::Notify(format!("{} - {}", status, text)));
    }
    Ok(())
}

/// Posts the structured event as JSON to a metrics collector.
pub struct MetricsNotifier {
    url: String,
    client: Client,
}

impl MetricsNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Notifier for MetricsNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<()> {
        debug!("Sending metric event for run {}", event.run_id);
        post_json(&self.client, &self.url, &serde_json::to_value(event)?).await
    }

    fn name(&self) -> &'static str {
        "Metrics"
    }
}

/// Posts a human-readable message to a chat webhook. The body carries both
/// `text` (Slack) and `content` (Discord).
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<()> {
        let message = event.message();
        let body = serde_json::json!({
            "text": message,
            "content": message,
        });
        post_json(&self.client, &self.url, &body).await
    }

    fn name(&self) -> &'static str {
        "Webhook"
    }
}
