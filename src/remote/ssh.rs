//! OpenSSH-backed remote sessions
//!
//! Each session multiplexes its commands over one master connection
//! (`ControlMaster`), so `connect` pays the handshake once and every `exec`
//! reuses it. Password credentials go through `sshpass -e`, which reads the
//! password from the environment instead of the command line.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use super::{CommandOutput, RemoteConnector, RemoteError, RemoteSession, RemoteTarget, mask_secrets};
use crate::model::Credential;

/// Creates [`OpenSshSession`]s using the `ssh` binary on `PATH`
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    connect_timeout: Duration,
    control_dir: PathBuf,
}

impl OpenSshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            control_dir: std::env::temp_dir(),
        }
    }
}

#[async_trait]
impl RemoteConnector for OpenSshConnector {
    #[instrument(skip(self), fields(target = %target))]
    async fn connect(
        &self,
        target: &RemoteTarget,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let control_path = self
            .control_dir
            .join(format!("fleetwarden-{}-{}-{}", target.user, target.host, target.port));

        let mut session = OpenSshSession {
            target: target.clone(),
            control_path,
            connect_timeout: self.connect_timeout,
        };

        let probe = session
            .exec("true", self.connect_timeout + Duration::from_secs(5))
            .await
            .map_err(|e| RemoteError::Connect {
                target: target.to_string(),
                reason: e.to_string(),
            })?;

        // 255 is ssh's own failure code (auth, host key, network)
        if !probe.success() {
            let reason = if probe.stderr.trim().is_empty() {
                format!("ssh exited with {}", probe.return_code)
            } else {
                probe.stderr.trim().to_string()
            };
            return Err(RemoteError::Connect {
                target: target.to_string(),
                reason,
            });
        }

        debug!("session established");
        Ok(Box::new(session))
    }
}

/// A multiplexed OpenSSH session
pub struct OpenSshSession {
    target: RemoteTarget,
    control_path: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshSession {
    fn command(&self) -> Command {
        let mut cmd = match &self.target.credential {
            Credential::Password { password } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            Credential::KeyFile { path } => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                cmd
            }
        };

        cmd.arg("-p")
            .arg(self.target.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg(format!("{}@{}", self.target.user, self.target.host))
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        trace!("executing command: {}", mask_secrets(command));

        let mut cmd = self.command();
        cmd.arg("--").arg(command).stdin(Stdio::null());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RemoteError::Timeout(timeout.as_secs()))??;

        Ok(CommandOutput {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn upload(&mut self, content: &str, remote_path: &str) -> Result<(), RemoteError> {
        let upload_err = |reason: String| RemoteError::Upload {
            path: remote_path.to_string(),
            reason,
        };

        let mut cmd = self.command();
        cmd.arg("--")
            .arg(format!("cat > '{}'", remote_path.replace('\'', r"'\''")))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.connect_timeout * 3, child.wait_with_output())
            .await
            .map_err(|_| upload_err("timed out".to_string()))??;

        if !output.status.success() {
            return Err(upload_err(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn disconnect(self: Box<Self>) {
        let result = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(format!("{}@{}", self.target.user, self.target.host))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Err(e) = result {
            warn!("failed to close control connection for {}: {e}", self.target);
        }
    }
}
