//! Housekeeping actor: retention cleanup and the undelivered-alert sweep

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use super::messages::{MaintenanceCommand, RetentionSummary};
use crate::config::RetentionConfig;
use crate::ledger::{AlertLedger, RetrySummary};
use crate::scheduler::Ticker;
use crate::storage::Store;

pub struct Maintenance {
    store: Arc<dyn Store>,
    ledger: AlertLedger,
    retention: RetentionConfig,
    retry_batch: usize,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: AlertLedger,
        retention: RetentionConfig,
        retry_batch: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            retention,
            retry_batch,
        }
    }

    /// Delete samples, terminal task logs and completed tasks past their retention
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<RetentionSummary> {
        let now = Utc::now();
        let days = |n: u32| now - ChronoDuration::days(i64::from(n));

        let samples = self
            .store
            .delete_samples_before(days(self.retention.metrics_days))
            .await
            .context("failed to delete old samples")?;

        let task_logs = self
            .store
            .delete_task_logs_before(days(self.retention.task_logs_days))
            .await
            .context("failed to delete old task logs")?;

        let tasks = self
            .store
            .delete_completed_tasks_before(days(self.retention.completed_tasks_days))
            .await
            .context("failed to delete old tasks")?;

        let summary = RetentionSummary {
            samples,
            task_logs,
            tasks,
        };
        if samples + task_logs + tasks > 0 {
            info!(
                "retention sweep removed {} samples, {} task logs, {} tasks",
                samples, task_logs, tasks
            );
        }
        Ok(summary)
    }

    pub async fn retry_alerts(&self) -> Result<RetrySummary> {
        self.ledger
            .retry_undelivered(self.retry_batch)
            .await
            .context("failed to retry undelivered alerts")
    }
}

struct MaintenanceActor {
    maintenance: Maintenance,
    retention_ticker: Ticker,
    retry_ticker: Ticker,
    command_rx: mpsc::Receiver<MaintenanceCommand>,
}

impl MaintenanceActor {
    #[instrument(skip(self), name = "maintenance")]
    async fn run(mut self) {
        debug!("starting maintenance actor");

        loop {
            tokio::select! {
                _ = self.retention_ticker.tick() => {
                    if let Err(e) = self.maintenance.sweep().await {
                        error!("retention sweep failed: {:#}", e);
                    }
                }

                _ = self.retry_ticker.tick() => {
                    if let Err(e) = self.maintenance.retry_alerts().await {
                        error!("alert retry failed: {:#}", e);
                    }
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(MaintenanceCommand::SweepNow { respond_to }) => {
                        let _ = respond_to.send(self.maintenance.sweep().await);
                    }
                    Some(MaintenanceCommand::RetryNow { respond_to }) => {
                        let _ = respond_to.send(self.maintenance.retry_alerts().await);
                    }
                    Some(MaintenanceCommand::Shutdown) => {
                        debug!("received shutdown command");
                        break;
                    }
                    None => {
                        warn!("command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        debug!("maintenance actor stopped");
    }
}

#[derive(Clone)]
pub struct MaintenanceHandle {
    sender: mpsc::Sender<MaintenanceCommand>,
}

impl MaintenanceHandle {
    pub fn spawn(maintenance: Maintenance, retention_ticker: Ticker, retry_ticker: Ticker) -> Self {
        let (sender, command_rx) = mpsc::channel(8);
        tokio::spawn(
            MaintenanceActor {
                maintenance,
                retention_ticker,
                retry_ticker,
                command_rx,
            }
            .run(),
        );
        Self { sender }
    }

    pub async fn sweep_now(&self) -> Result<RetentionSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MaintenanceCommand::SweepNow { respond_to: tx })
            .await
            .context("failed to send SweepNow command")?;
        rx.await.context("maintenance actor dropped the response")?
    }

    pub async fn retry_now(&self) -> Result<RetrySummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(MaintenanceCommand::RetryNow { respond_to: tx })
            .await
            .context("failed to send RetryNow command")?;
        rx.await.context("maintenance actor dropped the response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(MaintenanceCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
