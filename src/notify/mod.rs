//! Outbound alert delivery
//!
//! A [`Notifier`] pushes one pre-rendered message to an external channel.
//! Rendering lives here too, so every channel sees the same text.

pub mod telegram;
pub mod webhook;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Alert, AlertLevel};

pub use telegram::TelegramNotifier;
pub use webhook::WebhookNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Plain,
    Markdown,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("notification rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str, format: MessageFormat) -> Result<(), NotifyError>;
}

/// Escape characters that Telegram's legacy Markdown treats as markup
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn level_emoji(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Info => "ℹ️",
        AlertLevel::Warning => "⚠️",
        AlertLevel::Error => "❌",
        AlertLevel::Critical => "🚨",
    }
}

/// Render an alert as a Markdown message
pub fn format_alert(alert: &Alert) -> String {
    format!(
        "{} *{}*\n\n{}\n\n*Level:* {}\n*Type:* {}\n*Time:* {} UTC",
        level_emoji(alert.level),
        escape_markdown(&alert.title),
        escape_markdown(&alert.message),
        alert.level.as_str().to_uppercase(),
        escape_markdown(alert.alert_kind.as_str()),
        alert.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}
