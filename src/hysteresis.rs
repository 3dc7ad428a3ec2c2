//! Threshold and hysteresis evaluation
//!
//! Every alert key has exactly one open/closed slot in the store. A signal only
//! produces an [`AlertEvent`] when it flips that slot:
//!
//! ```text
//!            breaching                    not breaching
//!  closed ──────────────▶ open  ─────────────────────────▶ closed
//!        (warning / error)            (info, "recovered")
//! ```
//!
//! Steady signals in either state are no-ops, which is what keeps a host that
//! stays hot from producing an alert every cycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::model::{Alert, AlertKey, AlertKind, AlertLevel, NewAlert};
use crate::storage::{Store, StoreResult};

/// Direction of a slot flip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
}

/// The pure state machine: what happens to a slot in state `is_open` given a signal
pub fn transition(is_open: bool, breaching: bool) -> Option<Transition> {
    match (is_open, breaching) {
        (false, true) => Some(Transition::Opened),
        (true, false) => Some(Transition::Closed),
        _ => None,
    }
}

/// Numeric breach rule: at or above the threshold
pub fn is_breaching(value: f64, threshold: f64) -> bool {
    value >= threshold
}

/// One observation fed into the engine
#[derive(Debug, Clone)]
pub struct Signal {
    pub key: AlertKey,
    pub breaching: bool,
    /// Display name of the host or domain
    pub subject: String,
    /// Human-readable reading, e.g. `"CPU usage at 91.0% (threshold 85%)"`
    pub detail: String,
}

/// Alert produced by a slot flip, ready for the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub key: AlertKey,
    pub transition: Transition,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
}

impl AlertEvent {
    pub fn into_new_alert(self) -> NewAlert {
        NewAlert {
            key: self.key,
            level: self.level,
            title: self.title,
            message: self.message,
            created_at: Utc::now(),
        }
    }
}

fn title_for(kind: AlertKind, transition: Transition, subject: &str) -> String {
    match (kind, transition) {
        (AlertKind::CpuHigh, Transition::Opened) => format!("High CPU usage on {subject}"),
        (AlertKind::CpuHigh, Transition::Closed) => format!("CPU usage recovered on {subject}"),
        (AlertKind::MemHigh, Transition::Opened) => format!("High memory usage on {subject}"),
        (AlertKind::MemHigh, Transition::Closed) => {
            format!("Memory usage recovered on {subject}")
        }
        (AlertKind::DiskHigh, Transition::Opened) => format!("High disk usage on {subject}"),
        (AlertKind::DiskHigh, Transition::Closed) => format!("Disk usage recovered on {subject}"),
        (AlertKind::Unreachable, Transition::Opened) => format!("Server {subject} is unreachable"),
        (AlertKind::Unreachable, Transition::Closed) => {
            format!("Server {subject} is reachable again")
        }
        (AlertKind::NsFailed, Transition::Opened) => format!("NS check failed for {subject}"),
        (AlertKind::NsFailed, Transition::Closed) => format!("NS check recovered for {subject}"),
    }
}

/// Build the event for a flip without touching the store
pub fn render(signal: &Signal, transition: Transition) -> AlertEvent {
    let level = match transition {
        Transition::Opened => signal.key.alert_kind.breach_level(),
        Transition::Closed => AlertLevel::Info,
    };

    AlertEvent {
        key: signal.key,
        transition,
        level,
        title: title_for(signal.key.alert_kind, transition, &signal.subject),
        message: signal.detail.clone(),
    }
}

/// Applies signals to the durable hysteresis table
#[derive(Clone)]
pub struct ThresholdEngine {
    store: Arc<dyn Store>,
}

impl ThresholdEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Apply one signal. Returns an event only when the key's state flipped.
    #[instrument(skip(self, signal), fields(subject = %signal.subject, kind = %signal.key.alert_kind))]
    pub async fn evaluate(&self, signal: &Signal) -> StoreResult<Option<AlertEvent>> {
        let Some(is_open) = self
            .store
            .transition_alert_key(&signal.key, signal.breaching)
            .await?
        else {
            return Ok(None);
        };

        let transition = if is_open {
            Transition::Opened
        } else {
            Transition::Closed
        };
        debug!("alert key {:?}", transition);

        Ok(Some(render(signal, transition)))
    }

    /// Apply one signal and persist the alert for a flip in the same store step
    ///
    /// A flip is always towards `signal.breaching`, so the alert is rendered up
    /// front and only kept when the slot actually changes.
    #[instrument(skip(self, signal), fields(subject = %signal.subject, kind = %signal.key.alert_kind))]
    pub async fn evaluate_and_record(&self, signal: &Signal) -> StoreResult<Option<Alert>> {
        let transition = if signal.breaching {
            Transition::Opened
        } else {
            Transition::Closed
        };
        let alert = render(signal, transition).into_new_alert();

        let recorded = self
            .store
            .transition_alert_key_and_record(&signal.key, signal.breaching, alert)
            .await?;
        if recorded.is_some() {
            debug!("alert key {:?}", transition);
        }
        Ok(recorded)
    }
}
