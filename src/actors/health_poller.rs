//! Health poller: fetches every host's snapshot, tracks reachability, raises alerts
//!
//! ## Per-host flow
//!
//! ```text
//! fetch ──ok──▶ parse ──ok──▶ store sample ─▶ health = Ok/0 ─▶ unreachable(recovered?) ─▶ cpu/mem/disk
//!   │             │
//!   └──err────────┴──▶ failures += 1 ─▶ (failures >= max and not yet Unreachable) ─▶ unreachable(breach)
//! ```
//!
//! Host recovery only closes the `unreachable` key. Resource keys stay open
//! until a reading under the threshold closes them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use super::Alerting;
use super::messages::{PollSummary, PollerCommand};
use crate::config::Thresholds;
use crate::hysteresis::{Signal, is_breaching};
use crate::metrics::{HealthSnapshot, MetricsClient, MetricsError};
use crate::model::{AlertKey, AlertKind, Host, HostHealth, HostId, Reachability};
use crate::scheduler::Ticker;
use crate::storage::Store;

const RESOURCE_KINDS: [AlertKind; 3] = [AlertKind::CpuHigh, AlertKind::MemHigh, AlertKind::DiskHigh];

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub thresholds: Thresholds,
    pub max_failures: u32,
    pub concurrency: usize,
    /// Upper bound for one host's fetch
    pub timeout: Duration,
}

impl PollerSettings {
    fn threshold_for(&self, kind: AlertKind) -> Option<(&'static str, f64)> {
        match kind {
            AlertKind::CpuHigh => Some(("CPU", self.thresholds.cpu)),
            AlertKind::MemHigh => Some(("Memory", self.thresholds.memory)),
            AlertKind::DiskHigh => Some(("Disk", self.thresholds.disk)),
            AlertKind::Unreachable | AlertKind::NsFailed => None,
        }
    }
}

enum HostOutcome {
    Succeeded,
    Failed,
}

pub struct HealthPoller {
    store: Arc<dyn Store>,
    client: Arc<dyn MetricsClient>,
    alerting: Alerting,
    settings: PollerSettings,
    /// Hosts whose configuration error has already been logged
    misconfigured: HashSet<HostId>,
}

impl HealthPoller {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn MetricsClient>,
        alerting: Alerting,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            client,
            alerting,
            settings,
            misconfigured: HashSet::new(),
        }
    }

    /// Poll every registered host once
    ///
    /// One host's failure never aborts the cycle. Store errors for a single
    /// host are logged and counted as a failed poll.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> PollSummary {
        let hosts = match self.store.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                error!("failed to list hosts: {:#}", e);
                return PollSummary::default();
            }
        };

        let mut summary = PollSummary::default();
        let mut targets = Vec::with_capacity(hosts.len());

        for host in hosts {
            match host.metrics.url(&host.address) {
                Ok(url) => {
                    self.misconfigured.remove(&host.id);
                    targets.push((host, url));
                }
                Err(e) => {
                    if self.misconfigured.insert(host.id) {
                        warn!("skipping host {}: {}", host.name, e);
                    }
                    summary.skipped += 1;
                }
            }
        }

        let this = &*self;
        let outcomes: Vec<Result<HostOutcome>> = futures::stream::iter(targets)
            .map(|(host, url)| this.poll_host(host, url))
            .buffer_unordered(this.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            summary.polled += 1;
            match outcome {
                Ok(HostOutcome::Succeeded) => summary.succeeded += 1,
                Ok(HostOutcome::Failed) => summary.failed += 1,
                Err(e) => {
                    error!("failed to record poll result: {:#}", e);
                    summary.failed += 1;
                }
            }
        }

        debug!(
            "poll cycle done: {} polled, {} ok, {} failed, {} skipped",
            summary.polled, summary.succeeded, summary.failed, summary.skipped
        );
        summary
    }

    async fn fetch_snapshot(
        &self,
        url: &str,
        host: &Host,
    ) -> Result<(HealthSnapshot, serde_json::Value), MetricsError> {
        let payload = tokio::time::timeout(
            self.settings.timeout,
            self.client.fetch(url, &host.metrics.auth),
        )
        .await
        .map_err(|_| MetricsError::Timeout(self.settings.timeout.as_secs()))??;

        let snapshot = HealthSnapshot::from_payload(&payload)?;
        Ok((snapshot, payload))
    }

    #[instrument(skip(self, host, url), fields(host = %host.name))]
    async fn poll_host(&self, host: Host, url: String) -> Result<HostOutcome> {
        let checked_at = Utc::now();

        match self.fetch_snapshot(&url, &host).await {
            Ok((snapshot, payload)) => {
                trace!("snapshot received");
                self.on_success(&host, snapshot, payload, checked_at).await?;
                Ok(HostOutcome::Succeeded)
            }
            Err(e) => {
                debug!("poll failed: {}", e);
                self.on_failure(&host, &e, checked_at).await?;
                Ok(HostOutcome::Failed)
            }
        }
    }

    async fn on_success(
        &self,
        host: &Host,
        snapshot: HealthSnapshot,
        payload: serde_json::Value,
        checked_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let readings: Vec<(AlertKind, f64)> = RESOURCE_KINDS
            .iter()
            .filter_map(|&kind| snapshot.value_for(kind).map(|value| (kind, value)))
            .collect();

        self.store
            .insert_sample(&snapshot.into_sample(host.id, payload, checked_at))
            .await
            .context("failed to store sample")?;

        self.store
            .update_host_health(
                host.id,
                HostHealth {
                    reachability: Reachability::Ok,
                    consecutive_failures: 0,
                    last_checked_at: checked_at,
                },
            )
            .await
            .context("failed to update host health")?;

        if host.reachability == Reachability::Unreachable {
            info!("host is reachable again");
        }

        self.alerting
            .signal(&Signal {
                key: AlertKey::host(host.id, AlertKind::Unreachable),
                breaching: false,
                subject: host.name.clone(),
                detail: format!("Server {} is responding to health checks again", host.name),
            })
            .await
            .context("failed to evaluate reachability")?;

        for (kind, value) in readings {
            let Some((label, threshold)) = self.settings.threshold_for(kind) else {
                continue;
            };

            self.alerting
                .signal(&Signal {
                    key: AlertKey::host(host.id, kind),
                    breaching: is_breaching(value, threshold),
                    subject: host.name.clone(),
                    detail: format!("{label} usage at {value:.1}% (threshold {threshold}%)"),
                })
                .await
                .with_context(|| format!("failed to evaluate {kind}"))?;
        }

        Ok(())
    }

    async fn on_failure(
        &self,
        host: &Host,
        err: &MetricsError,
        checked_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let failures = host.consecutive_failures.saturating_add(1);
        let crossed = failures >= self.settings.max_failures
            && host.reachability != Reachability::Unreachable;

        let reachability = if crossed {
            Reachability::Unreachable
        } else {
            host.reachability
        };

        self.store
            .update_host_health(
                host.id,
                HostHealth {
                    reachability,
                    consecutive_failures: failures,
                    last_checked_at: checked_at,
                },
            )
            .await
            .context("failed to update host health")?;

        if crossed {
            warn!("host unreachable after {} consecutive failures", failures);
            self.alerting
                .signal(&Signal {
                    key: AlertKey::host(host.id, AlertKind::Unreachable),
                    breaching: true,
                    subject: host.name.clone(),
                    detail: format!(
                        "Server {} has been unreachable for {} consecutive checks. Last error: {}",
                        host.name, failures, err
                    ),
                })
                .await
                .context("failed to evaluate reachability")?;
        }

        Ok(())
    }
}

struct PollerActor {
    poller: HealthPoller,
    ticker: Ticker,
    command_rx: mpsc::Receiver<PollerCommand>,
}

impl PollerActor {
    #[instrument(skip(self), name = "health_poller")]
    async fn run(mut self) {
        debug!("starting health poller, period {:?}", self.ticker.period());

        loop {
            tokio::select! {
                _ = self.ticker.tick() => {
                    self.poller.run_cycle().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(PollerCommand::PollNow { respond_to }) => {
                        debug!("received PollNow command");
                        let summary = self.poller.run_cycle().await;
                        let _ = respond_to.send(summary);
                    }
                    Some(PollerCommand::Shutdown) => {
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

        debug!("health poller stopped");
    }
}

/// Handle for controlling the health poller actor
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::Sender<PollerCommand>,
}

impl PollerHandle {
    pub fn spawn(poller: HealthPoller, ticker: Ticker) -> Self {
        let (sender, command_rx) = mpsc::channel(8);
        let actor = PollerActor {
            poller,
            ticker,
            command_rx,
        };

        tokio::spawn(actor.run());

        Self { sender }
    }

    /// Run a cycle now and wait for its summary
    pub async fn poll_now(&self) -> Result<PollSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PollerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("poller dropped the response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(PollerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
