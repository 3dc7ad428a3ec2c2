//! Shared state passed to all API handlers

use std::sync::Arc;

use crate::actors::PollerHandle;
use crate::ledger::AlertLedger;
use crate::storage::Store;
use crate::tasks::TaskEngine;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,

    pub tasks: TaskEngine,

    pub ledger: AlertLedger,

    /// Absent when polling is disabled, e.g. in tests
    pub poller: Option<PollerHandle>,
}

impl ApiState {
    pub fn new(store: Arc<dyn Store>, tasks: TaskEngine, ledger: AlertLedger) -> Self {
        Self {
            store,
            tasks,
            ledger,
            poller: None,
        }
    }

    pub fn with_poller(mut self, poller: PollerHandle) -> Self {
        self.poller = Some(poller);
        self
    }
}
