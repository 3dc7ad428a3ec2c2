//! Commands and cycle summaries exchanged with the background actors

use serde::Serialize;
use tokio::sync::oneshot;

/// What one health-poll cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    /// Hosts whose agent was contacted
    pub polled: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Hosts left out because of a configuration error
    pub skipped: usize,
}

/// What one NS-check cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub checked: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Domains whose check could not be recorded
    pub errors: usize,
}

/// Rows removed by one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionSummary {
    pub samples: u64,
    pub task_logs: u64,
    pub tasks: u64,
}

#[derive(Debug)]
pub enum PollerCommand {
    /// Run a cycle now. Queues behind a cycle that is already running.
    PollNow {
        respond_to: oneshot::Sender<PollSummary>,
    },

    Shutdown,
}

#[derive(Debug)]
pub enum CheckerCommand {
    CheckNow {
        respond_to: oneshot::Sender<CheckSummary>,
    },

    Shutdown,
}

#[derive(Debug)]
pub enum MaintenanceCommand {
    /// Run the retention sweep now
    SweepNow {
        respond_to: oneshot::Sender<anyhow::Result<RetentionSummary>>,
    },

    /// Retry undelivered alerts now
    RetryNow {
        respond_to: oneshot::Sender<anyhow::Result<crate::ledger::RetrySummary>>,
    },

    Shutdown,
}
