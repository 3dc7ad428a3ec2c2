//! Domain checker: verifies each domain's nameservers against its NS policy

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use super::Alerting;
use super::messages::{CheckSummary, CheckerCommand};
use crate::dns::{NameResolver, RecordType, evaluate_ns_policy};
use crate::hysteresis::Signal;
use crate::model::{AlertKey, Domain, NewNsCheck};
use crate::scheduler::Ticker;
use crate::storage::Store;

const CHECK_CONCURRENCY: usize = 8;

pub struct DomainChecker {
    store: Arc<dyn Store>,
    resolver: Arc<dyn NameResolver>,
    alerting: Alerting,
    servers: Vec<String>,
    timeout: Duration,
}

impl DomainChecker {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn NameResolver>,
        alerting: Alerting,
        servers: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            alerting,
            servers,
            timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CheckSummary {
        let domains = match self.store.list_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                error!("failed to list domains: {:#}", e);
                return CheckSummary::default();
            }
        };

        let outcomes: Vec<Result<bool>> = futures::stream::iter(domains)
            .map(|domain| self.check_domain(domain))
            .buffer_unordered(CHECK_CONCURRENCY)
            .collect()
            .await;

        let mut summary = CheckSummary::default();
        for outcome in outcomes {
            summary.checked += 1;
            match outcome {
                Ok(true) => summary.valid += 1,
                Ok(false) => summary.invalid += 1,
                Err(e) => {
                    error!("failed to record NS check: {:#}", e);
                    summary.errors += 1;
                }
            }
        }

        debug!(
            "NS check cycle done: {} checked, {} valid, {} invalid",
            summary.checked, summary.valid, summary.invalid
        );
        summary
    }

    /// Returns whether the domain complies with its policy
    #[instrument(skip(self, domain), fields(domain = %domain.name))]
    async fn check_domain(&self, domain: Domain) -> Result<bool> {
        let resolved = self
            .resolver
            .resolve(&domain.name, RecordType::Ns, &self.servers, self.timeout)
            .await;
        let verdict = evaluate_ns_policy(resolved, &domain.ns_policy);

        if let Some(err) = &verdict.error {
            debug!("NS check failed: {}", err);
        }

        self.store
            .record_ns_check(NewNsCheck {
                domain_id: domain.id,
                nameservers: verdict.nameservers.clone(),
                is_valid: verdict.is_valid,
                error: verdict.error.clone(),
                checked_at: Utc::now(),
            })
            .await
            .context("failed to store NS check")?;

        let detail = match &verdict.error {
            Some(err) => err.clone(),
            None => format!("Nameservers: {}", verdict.nameservers.join(", ")),
        };

        self.alerting
            .signal(&Signal {
                key: AlertKey::domain(domain.id),
                breaching: !verdict.is_valid,
                subject: domain.name.clone(),
                detail,
            })
            .await
            .context("failed to evaluate NS policy")?;

        Ok(verdict.is_valid)
    }
}

struct CheckerActor {
    checker: DomainChecker,
    ticker: Ticker,
    command_rx: mpsc::Receiver<CheckerCommand>,
}

impl CheckerActor {
    #[instrument(skip(self), name = "domain_checker")]
    async fn run(mut self) {
        debug!("starting domain checker, period {:?}", self.ticker.period());

        loop {
            tokio::select! {
                _ = self.ticker.tick() => {
                    self.checker.run_cycle().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(CheckerCommand::CheckNow { respond_to }) => {
                        let summary = self.checker.run_cycle().await;
                        let _ = respond_to.send(summary);
                    }
                    Some(CheckerCommand::Shutdown) => {
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

        debug!("domain checker stopped");
    }
}

#[derive(Clone)]
pub struct CheckerHandle {
    sender: mpsc::Sender<CheckerCommand>,
}

impl CheckerHandle {
    pub fn spawn(checker: DomainChecker, ticker: Ticker) -> Self {
        let (sender, command_rx) = mpsc::channel(8);
        tokio::spawn(
            CheckerActor {
                checker,
                ticker,
                command_rx,
            }
            .run(),
        );
        Self { sender }
    }

    pub async fn check_now(&self) -> Result<CheckSummary> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CheckerCommand::CheckNow { respond_to: tx })
            .await
            .context("failed to send CheckNow command")?;
        rx.await.context("domain checker dropped the response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CheckerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")
    }
}
