//! Step recorder handed to every job
//!
//! All side effects of a job go through [`JobContext`]: log entries are stored
//! and then published, progress only moves forward, and every milestone is a
//! cancellation checkpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::model::{LogLevel, NewLogEntry, TaskId};
use crate::remote::{CommandOutput, RemoteConnector, RemoteSession, RemoteTarget, mask_secrets};
use crate::storage::Store;
use crate::stream::LogHub;

/// Returned from a checkpoint once the task has been cancelled
#[derive(Debug, Error)]
#[error("task cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    /// Ordinary commands
    pub command: Duration,
    /// Package installs and certificate issuance
    pub install: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(30),
            install: Duration::from_secs(600),
        }
    }
}

pub struct JobContext {
    store: Arc<dyn Store>,
    hub: LogHub,
    task_id: TaskId,
    token: CancellationToken,
    pub timeouts: StepTimeouts,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn Store>,
        hub: LogHub,
        task_id: TaskId,
        token: CancellationToken,
        timeouts: StepTimeouts,
    ) -> Self {
        Self {
            store,
            hub,
            task_id,
            token,
            timeouts,
        }
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            bail!(Cancelled);
        }
        Ok(())
    }

    pub async fn log(&self, entry: NewLogEntry) -> Result<()> {
        let stored = self
            .store
            .append_task_log(self.task_id, entry)
            .await
            .context("failed to append task log")?;
        self.hub.publish_log(&stored).await;
        Ok(())
    }

    pub async fn info(&self, source: &str, message: impl Into<String>) -> Result<()> {
        self.log(NewLogEntry::new(LogLevel::Info, source, message)).await
    }

    /// Record a completed step, then check for cancellation
    pub async fn reach(&self, milestone: u8) -> Result<()> {
        let progress = self
            .store
            .advance_progress(self.task_id, milestone)
            .await
            .context("failed to advance progress")?;

        if let Some(progress) = progress {
            trace!("task {} at {}%", self.task_id, progress);
            self.hub.publish_progress(self.task_id, progress).await;
        }
        self.checkpoint()
    }

    pub async fn connect(
        &self,
        connector: &dyn RemoteConnector,
        target: &RemoteTarget,
    ) -> Result<Box<dyn RemoteSession>> {
        self.info("ssh", format!("Connecting to {target}")).await?;

        match connector.connect(target).await {
            Ok(session) => {
                self.info("ssh", format!("Connected to {target}")).await?;
                Ok(session)
            }
            Err(e) => {
                self.log(NewLogEntry::new(LogLevel::Error, "ssh", e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    pub async fn disconnect(&self, session: Box<dyn RemoteSession>) -> Result<()> {
        session.disconnect().await;
        self.info("ssh", "Disconnected").await
    }

    /// Run a command and record its output without judging the return code
    pub async fn exec(
        &self,
        session: &mut dyn RemoteSession,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let shown = mask_secrets(command);
        let output = match session.exec(command, timeout).await {
            Ok(output) => output,
            Err(e) => {
                self.log(NewLogEntry::new(
                    LogLevel::Error,
                    "ssh",
                    format!("Failed to execute: {shown}: {e}"),
                ))
                .await?;
                return Err(e).with_context(|| format!("failed to execute `{shown}`"));
            }
        };

        let level = if output.success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.log(
            NewLogEntry::new(level, "ssh", format!("Executed: {shown}")).with_output(
                &output.stdout,
                &output.stderr,
                output.return_code,
            ),
        )
        .await?;

        Ok(output)
    }

    /// Run a command that must exit with 0
    ///
    /// A non-zero exit fails the step with the command's stderr, or its stdout
    /// when stderr is empty.
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let output = self.exec(session, command, timeout).await?;
        if !output.success() {
            bail!("{}", failure_detail(&output));
        }
        Ok(output)
    }

    pub async fn upload(
        &self,
        session: &mut dyn RemoteSession,
        content: &str,
        remote_path: &str,
    ) -> Result<()> {
        session.upload(content, remote_path).await?;
        self.info("ssh", format!("Uploaded {remote_path} ({} bytes)", content.len()))
            .await
    }
}

pub fn failure_detail(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("command exited with code {}", output.return_code)
}
