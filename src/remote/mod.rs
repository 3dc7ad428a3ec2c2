//! Remote command execution
//!
//! Provisioning jobs open one session per task through a [`RemoteConnector`],
//! run shell commands, upload files and disconnect. The production
//! implementation drives the system OpenSSH client ([`ssh::OpenSshConnector`]).

pub mod ssh;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::model::{Credential, Host};

pub use ssh::OpenSshConnector;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("upload to {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to open a session on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
}

impl From<&Host> for RemoteTarget {
    fn from(host: &Host) -> Self {
        Self {
            host: host.address.clone(),
            port: host.ssh_port,
            user: host.ssh_user.clone(),
            credential: host.credential.clone(),
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Opens sessions on remote hosts
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// One open shell session
#[async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str, timeout: Duration)
    -> Result<CommandOutput, RemoteError>;

    async fn upload(&mut self, content: &str, remote_path: &str) -> Result<(), RemoteError>;

    async fn disconnect(self: Box<Self>);
}

static SECRET_ARG: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(\S*(?:password|passwd|pass|secret|token|key)\S*\s+)\S+").ok()
});

/// Replace the argument following any secret-looking word with `***`
pub fn mask_secrets(command: &str) -> String {
    match SECRET_ARG.as_ref() {
        Some(re) => re.replace_all(command, "${1}***").into_owned(),
        None => "***".to_string(),
    }
}
