//! Telegram Bot API notifier

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};

use super::{MessageFormat, Notifier, NotifyError};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Sends messages to one chat through `sendMessage`
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        api_base: Option<String>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::ChannelUnavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip(self, text))]
    async fn send(&self, text: &str, format: MessageFormat) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);

        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if format == MessageFormat::Markdown {
            payload["parse_mode"] = json!("Markdown");
        }

        let response = self.client.post(&url).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("telegram message delivered");
        Ok(())
    }
}
