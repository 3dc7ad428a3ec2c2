//! Hub configuration
//!
//! The hub reads a single JSON file. Every section is optional and falls back to
//! the defaults below, so `{}` is a valid configuration.
//!
//! ```json
//! {
//!   "thresholds": { "cpu": 85.0, "memory": 90.0, "disk": 85.0 },
//!   "poller": { "interval_secs": 60, "max_failures": 3 },
//!   "notifications": {
//!     "notifier": { "type": "telegram", "bot_token": "...", "chat_id": "-100123" }
//!   },
//!   "storage": { "backend": "sqlite", "path": "./fleetwarden.db" },
//!   "inventory": { "hosts": [], "domains": [] }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::model::NewHost;

/// Invalid or inconsistent configuration detected at startup
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("threshold '{name}' must be within 0..=100, got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("interval '{0}' must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("max_failures must be at least 1")]
    ZeroMaxFailures,

    #[error("dns.servers must not be empty")]
    NoDnsServers,

    #[error("telegram notifier needs both bot_token and chat_id")]
    IncompleteTelegram,

    #[error("webhook notifier url is empty")]
    EmptyWebhookUrl,

    #[error("domain '{domain}' references unknown host '{host}'")]
    UnknownHost { domain: String, host: String },
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default)
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleetwarden.db")
}

fn default_max_connections() -> u32 {
    5
}

/// Resource thresholds in percent. A reading at or above the threshold breaches.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            disk: default_disk_threshold(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    85.0
}

fn default_memory_threshold() -> f64 {
    90.0
}

fn default_disk_threshold() -> f64 {
    85.0
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Upper bound of the random delay added to every tick
    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Hosts fetched in parallel within one cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            jitter_secs: default_jitter(),
            max_failures: default_max_failures(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_jitter() -> u64 {
    5
}

fn default_max_failures() -> u32 {
    3
}

fn default_concurrency() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_timeout")]
    pub timeout_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_metrics_timeout(),
        }
    }
}

fn default_metrics_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DnsConfig {
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<String>,

    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_dns_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_jitter")]
    pub jitter_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
            timeout_secs: default_dns_timeout(),
            interval_secs: default_dns_interval(),
            jitter_secs: default_jitter(),
        }
    }
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()]
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_dns_interval() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SshConfig {
    #[serde(default = "default_ssh_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_ssh_command_timeout")]
    pub command_timeout_secs: u64,

    /// Long-running installs (package managers, pip) get this instead
    #[serde(default = "default_ssh_install_timeout")]
    pub install_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_ssh_connect_timeout(),
            command_timeout_secs: default_ssh_command_timeout(),
            install_timeout_secs: default_ssh_install_timeout(),
        }
    }
}

fn default_ssh_connect_timeout() -> u64 {
    10
}

fn default_ssh_command_timeout() -> u64 {
    30
}

fn default_ssh_install_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetentionConfig {
    #[serde(default = "default_metrics_days")]
    pub metrics_days: u32,

    #[serde(default = "default_task_logs_days")]
    pub task_logs_days: u32,

    #[serde(default = "default_completed_tasks_days")]
    pub completed_tasks_days: u32,

    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics_days: default_metrics_days(),
            task_logs_days: default_task_logs_days(),
            completed_tasks_days: default_completed_tasks_days(),
            interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_metrics_days() -> u32 {
    30
}

fn default_task_logs_days() -> u32 {
    30
}

fn default_completed_tasks_days() -> u32 {
    7
}

fn default_cleanup_interval() -> u64 {
    6 * 60 * 60
}

/// Outbound channel for alert messages
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifierConfig {
    #[default]
    None,
    Telegram {
        #[serde(default)]
        bot_token: String,
        #[serde(default)]
        chat_id: String,
        /// Override of the Bot API base URL
        #[serde(default)]
        api_base: Option<String>,
    },
    Webhook {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NotificationConfig {
    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    #[serde(default = "default_retry_batch")]
    pub retry_batch: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notifier: NotifierConfig::None,
            retry_interval_secs: default_retry_interval(),
            retry_batch: default_retry_batch(),
        }
    }
}

fn default_retry_interval() -> u64 {
    5 * 60
}

fn default_retry_batch() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ApiSettings {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            enable_cors: default_enable_cors(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_enable_cors() -> bool {
    true
}

/// Domain entry in the inventory. The host is referenced by name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InventoryDomain {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub ns_policy: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub upstream: Option<String>,
}

/// Hosts and domains registered at startup when not yet present in the store
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<NewHost>,
    #[serde(default)]
    pub domains: Vec<InventoryDomain>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub inventory: Inventory,
}

impl Config {
    /// Reject configurations the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("cpu", self.thresholds.cpu),
            ("memory", self.thresholds.memory),
            ("disk", self.thresholds.disk),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::ThresholdOutOfRange { name, value });
            }
        }

        for (name, secs) in [
            ("poller.interval_secs", self.poller.interval_secs),
            ("metrics.timeout_secs", self.metrics.timeout_secs),
            ("dns.interval_secs", self.dns.interval_secs),
            ("dns.timeout_secs", self.dns.timeout_secs),
            ("retention.interval_secs", self.retention.interval_secs),
            (
                "notifications.retry_interval_secs",
                self.notifications.retry_interval_secs,
            ),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.poller.max_failures == 0 {
            return Err(ConfigError::ZeroMaxFailures);
        }

        if self.dns.servers.is_empty() {
            return Err(ConfigError::NoDnsServers);
        }

        match &self.notifications.notifier {
            NotifierConfig::Telegram {
                bot_token, chat_id, ..
            } if bot_token.is_empty() || chat_id.is_empty() => {
                return Err(ConfigError::IncompleteTelegram);
            }
            NotifierConfig::Webhook { url } if url.is_empty() => {
                return Err(ConfigError::EmptyWebhookUrl);
            }
            _ => {}
        }

        for domain in &self.inventory.domains {
            if let Some(host) = &domain.host
                && !self.inventory.hosts.iter().any(|h| &h.name == host)
            {
                return Err(ConfigError::UnknownHost {
                    domain: domain.name.clone(),
                    host: host.clone(),
                });
            }
        }

        Ok(())
    }

    /// Apply secrets from the environment on top of the file
    ///
    /// `FLEETWARDEN_TELEGRAM_TOKEN` replaces the configured bot token.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("FLEETWARDEN_TELEGRAM_TOKEN")
            && let NotifierConfig::Telegram { bot_token, .. } = &mut self.notifications.notifier
        {
            *bot_token = token;
        }
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
