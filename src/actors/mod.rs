//! Background actors
//!
//! Each periodic loop runs as an independent tokio task that owns its state and
//! is controlled through an mpsc command channel:
//!
//! ```text
//!   Ticker ─┐
//!           ├─▶ HealthPoller ──▶ ThresholdEngine ──▶ AlertLedger ──▶ Notifier
//!  Command ─┘   DomainChecker ─┘
//!
//!   Ticker ───▶ Maintenance (retention sweep, undelivered alert retry)
//! ```
//!
//! A cycle runs inline in its actor's loop, so a tick that arrives while a
//! cycle is in flight is skipped and a manual trigger waits for it.

pub mod domain_checker;
pub mod health_poller;
pub mod maintenance;
pub mod messages;

use crate::hysteresis::{Signal, ThresholdEngine};
use crate::ledger::AlertLedger;
use crate::model::Alert;
use crate::storage::StoreResult;

pub use domain_checker::{CheckerHandle, DomainChecker};
pub use health_poller::{HealthPoller, PollerHandle, PollerSettings};
pub use maintenance::{Maintenance, MaintenanceHandle};
pub use messages::{CheckSummary, PollSummary, RetentionSummary};

/// Threshold engine and ledger wired together
#[derive(Clone)]
pub struct Alerting {
    pub engine: ThresholdEngine,
    pub ledger: AlertLedger,
}

impl Alerting {
    pub fn new(engine: ThresholdEngine, ledger: AlertLedger) -> Self {
        Self { engine, ledger }
    }

    /// Feed one signal through hysteresis and deliver the alert if the key flipped
    ///
    /// The flip and the alert row are stored together, so a failed write leaves
    /// the key untouched and the next breaching cycle retries it.
    pub async fn signal(&self, signal: &Signal) -> StoreResult<Option<Alert>> {
        match self.engine.evaluate_and_record(signal).await? {
            Some(alert) => Ok(Some(self.ledger.dispatch(alert).await?)),
            None => Ok(None),
        }
    }
}
