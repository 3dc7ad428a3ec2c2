//! Generic JSON webhook notifier

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument};

use super::{MessageFormat, Notifier, NotifyError};

/// POSTs `{"text", "format", "timestamp"}` to a fixed URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::ChannelUnavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip(self, text), fields(url = %self.url))]
    async fn send(&self, text: &str, format: MessageFormat) -> Result<(), NotifyError> {
        let payload = json!({
            "text": text,
            "format": match format {
                MessageFormat::Plain => "plain",
                MessageFormat::Markdown => "markdown",
            },
            "timestamp": Utc::now().to_rfc3339(),
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("webhook delivered");
        Ok(())
    }
}
