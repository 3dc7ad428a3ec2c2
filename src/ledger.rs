//! Alert ledger: persist first, deliver second
//!
//! Every alert event becomes an alert row before any delivery attempt, so a
//! notifier outage never loses an alert. Rows without `notified_at` are picked
//! up again by [`AlertLedger::retry_undelivered`], which makes delivery
//! at-least-once. Resolution is a separate, explicit operation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::hysteresis::AlertEvent;
use crate::model::{Alert, AlertId};
use crate::notify::{MessageFormat, Notifier, format_alert};
use crate::storage::{Store, StoreResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub delivered: usize,
}

#[derive(Clone)]
pub struct AlertLedger {
    store: Arc<dyn Store>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl AlertLedger {
    pub fn new(store: Arc<dyn Store>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self { store, notifier }
    }

    /// Persist an event and try to deliver it once
    ///
    /// Only storage errors are returned. Delivery failures are logged and left
    /// for the retry sweep.
    #[instrument(skip(self, event), fields(kind = %event.key.alert_kind, subject = event.key.subject_id))]
    pub async fn record(&self, event: AlertEvent) -> StoreResult<Alert> {
        let alert = self.store.insert_alert(event.into_new_alert()).await?;
        self.dispatch(alert).await
    }

    /// Try once to deliver an alert that is already persisted
    pub async fn dispatch(&self, mut alert: Alert) -> StoreResult<Alert> {
        debug!("recorded alert {}: {}", alert.id, alert.title);

        if self.deliver(&alert).await {
            let now = Utc::now();
            self.store.mark_alert_notified(alert.id, now).await?;
            alert.notified_at = Some(now);
        }

        Ok(alert)
    }

    async fn deliver(&self, alert: &Alert) -> bool {
        let Some(notifier) = &self.notifier else {
            return false;
        };

        match notifier
            .send(&format_alert(alert), MessageFormat::Markdown)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to deliver alert {}: {:#}", alert.id, e);
                false
            }
        }
    }

    /// Re-attempt delivery of up to `limit` undelivered, unresolved alerts
    #[instrument(skip(self))]
    pub async fn retry_undelivered(&self, limit: usize) -> StoreResult<RetrySummary> {
        if self.notifier.is_none() {
            return Ok(RetrySummary::default());
        }

        let pending = self.store.undelivered_alerts(limit).await?;
        let mut summary = RetrySummary {
            attempted: pending.len(),
            delivered: 0,
        };

        for alert in &pending {
            if self.deliver(alert).await {
                self.store.mark_alert_notified(alert.id, Utc::now()).await?;
                summary.delivered += 1;
            }
        }

        if summary.attempted > 0 {
            debug!(
                "retried {} alerts, {} delivered",
                summary.attempted, summary.delivered
            );
        }
        Ok(summary)
    }

    /// Mark an alert resolved. Returns `None` if it does not exist.
    pub async fn resolve(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        self.store.resolve_alert(id, Utc::now()).await
    }
}
