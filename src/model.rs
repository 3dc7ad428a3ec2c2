//! Domain records shared by the pollers, the alerting pipeline and the task engine
//!
//! Every type here is plain data. Persistence lives in [`crate::storage`], and the
//! string forms returned by the `as_str` helpers are the ones written to the database.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type HostId = i64;
pub type DomainId = i64;
pub type AlertId = i64;
pub type TaskId = i64;
pub type LogId = i64;

/// Error returned when a stored enum string does not match any known variant
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

/// Reachability of a host as seen by the health poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Provisioning,
    Ok,
    Unreachable,
}

string_enum!(Reachability, "reachability", {
    Provisioning => "provisioning",
    Ok => "ok",
    Unreachable => "unreachable",
});

/// How the SSH session authenticates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Password { password: String },
    KeyFile { path: PathBuf },
}

/// Authentication sent to the metrics endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer {
        token: String,
    },
}

/// Where the host's metrics agent listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsEndpoint {
    #[serde(default = "default_metrics_scheme")]
    pub scheme: String,

    /// Defaults to the host address when unset
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,

    #[serde(default)]
    pub auth: MetricsAuth,
}

impl Default for MetricsEndpoint {
    fn default() -> Self {
        Self {
            scheme: default_metrics_scheme(),
            host: None,
            port: default_metrics_port(),
            path: default_metrics_path(),
            auth: MetricsAuth::None,
        }
    }
}

fn default_metrics_scheme() -> String {
    "http".to_string()
}

pub const DEFAULT_AGENT_PORT: u16 = 61208;

fn default_metrics_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_metrics_path() -> String {
    "/api/4/all".to_string()
}

/// Per-host configuration problem. The host is skipped until it is fixed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostConfigError {
    #[error("unsupported metrics scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("metrics host is empty")]
    EmptyHost,

    #[error("basic auth for user '{0}' has no password")]
    MissingPassword(String),

    #[error("bearer auth has an empty token")]
    EmptyToken,
}

impl MetricsEndpoint {
    /// Build the snapshot URL, falling back to `address` when no explicit host is set
    pub fn url(&self, address: &str) -> Result<String, HostConfigError> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(HostConfigError::UnsupportedScheme(self.scheme.clone()));
        }

        let host = self.host.as_deref().unwrap_or(address).trim();
        if host.is_empty() {
            return Err(HostConfigError::EmptyHost);
        }

        match &self.auth {
            MetricsAuth::Basic { username, password } if password.is_none() => {
                return Err(HostConfigError::MissingPassword(username.clone()));
            }
            MetricsAuth::Bearer { token } if token.is_empty() => {
                return Err(HostConfigError::EmptyToken);
            }
            _ => {}
        }

        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        Ok(format!("{}://{}:{}{}", self.scheme, host, self.port, path))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub credential: Credential,
    pub metrics: MetricsEndpoint,
    pub reachability: Reachability,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Host as registered by the inventory layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHost {
    pub name: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub credential: Credential,
    #[serde(default)]
    pub metrics: MetricsEndpoint,
}

fn default_ssh_port() -> u16 {
    22
}

/// Poller-owned fields of a host, written back after every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostHealth {
    pub reachability: Reachability,
    pub consecutive_failures: u32,
    pub last_checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Point-in-time reading taken from one successful poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub host_id: HostId,
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub disk_pct: Option<f64>,
    pub load1: Option<f64>,
    pub load5: Option<f64>,
    pub load15: Option<f64>,
    pub uptime_secs: Option<u64>,
    pub raw_payload: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Host,
    Domain,
}

string_enum!(SubjectKind, "subject kind", {
    Host => "host",
    Domain => "domain",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CpuHigh,
    MemHigh,
    DiskHigh,
    Unreachable,
    NsFailed,
}

string_enum!(AlertKind, "alert kind", {
    CpuHigh => "cpu_high",
    MemHigh => "mem_high",
    DiskHigh => "disk_high",
    Unreachable => "unreachable",
    NsFailed => "ns_failed",
});

impl AlertKind {
    /// Level used when a key of this kind enters breach
    pub fn breach_level(&self) -> AlertLevel {
        match self {
            AlertKind::Unreachable => AlertLevel::Error,
            AlertKind::CpuHigh | AlertKind::MemHigh | AlertKind::DiskHigh | AlertKind::NsFailed => {
                AlertLevel::Warning
            }
        }
    }
}

/// Identity of one hysteresis slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub subject_id: i64,
    pub subject_kind: SubjectKind,
    pub alert_kind: AlertKind,
}

impl AlertKey {
    pub fn host(host_id: HostId, alert_kind: AlertKind) -> Self {
        Self {
            subject_id: host_id,
            subject_kind: SubjectKind::Host,
            alert_kind,
        }
    }

    pub fn domain(domain_id: DomainId) -> Self {
        Self {
            subject_id: domain_id,
            subject_kind: SubjectKind::Domain,
            alert_kind: AlertKind::NsFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

string_enum!(AlertLevel, "alert level", {
    Info => "info",
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub alert_kind: AlertKind,
    pub subject_kind: SubjectKind,
    pub subject_id: i64,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub key: AlertKey,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AlertFilter {
    #[serde(default)]
    pub unresolved: bool,
    pub subject_id: Option<i64>,
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub host_id: Option<HostId>,
    pub ns_policy: String,
    pub ssl: bool,
    pub upstream: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDomain {
    pub name: String,
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default = "default_ns_policy")]
    pub ns_policy: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub upstream: Option<String>,
}

pub fn default_ns_policy() -> String {
    "dnspod".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsCheckResult {
    pub id: i64,
    pub domain_id: DomainId,
    pub nameservers: Vec<String>,
    pub is_valid: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNsCheck {
    pub domain_id: DomainId,
    pub nameservers: Vec<String>,
    pub is_valid: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SshCheck,
    DeployProxy,
    InstallAgent,
    DeployDomain,
}

string_enum!(TaskKind, "task kind", {
    SshCheck => "ssh_check",
    DeployProxy => "deploy_proxy",
    InstallAgent => "install_agent",
    DeployDomain => "deploy_domain",
});

/// Lifecycle of a task. Serialized with the variant name (`"Running"`),
/// stored lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(TaskStatus, "task status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Name used in exports and the stream payload
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub host_id: Option<HostId>,
    pub domain_id: Option<DomainId>,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub kind: TaskKind,
    pub host_id: Option<HostId>,
    pub domain_id: Option<DomainId>,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

/// How a running task ends
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed { result: serde_json::Value },
    Failed { error: String, log: NewLogEntry },
}

/// Result of a guarded terminal transition
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask {
    pub task: Task,
    pub final_log: Option<TaskLogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDeletion {
    Deleted,
    NotFound,
    InProgress(TaskStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

string_enum!(LogLevel, "log level", {
    Debug => "DEBUG",
    Info => "INFO",
    Warning => "WARNING",
    Error => "ERROR",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: LogId,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_code: Option<i32>,
}

impl NewLogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            stdout: None,
            stderr: None,
            return_code: None,
        }
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str, return_code: i32) -> Self {
        self.stdout = (!stdout.is_empty()).then(|| stdout.to_string());
        self.stderr = (!stderr.is_empty()).then(|| stderr.to_string());
        self.return_code = Some(return_code);
        self
    }
}
