//! Store trait definition
//!
//! This module defines the `Store` trait that all persistence backends implement.
//! The trait covers every durable entity: hosts, metric samples, domains and their
//! NS check history, hysteresis key state, alerts, tasks and task logs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreResult;
use crate::model::{
    Alert, AlertFilter, AlertId, AlertKey, Domain, DomainId, FinishedTask, Host, HostHealth,
    HostId, LogId, MetricSample, NewAlert, NewDomain, NewHost, NewLogEntry, NewNsCheck, NewTask,
    NsCheckResult, Task, TaskDeletion, TaskFilter, TaskId, TaskLogEntry, TaskOutcome, TaskStats,
};

/// Health status of the storage backend
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Durable persistence for the fleet
///
/// ## Atomicity
///
/// Three operations carry invariants that other components rely on, so backends
/// must implement them as a single atomic unit:
///
/// - [`Store::transition_alert_key`] reads and flips one hysteresis slot, and
///   [`Store::transition_alert_key_and_record`] also writes the alert for the flip
/// - [`Store::append_task_log`] assigns strictly increasing ids
/// - [`Store::finish_task`] moves a running task to its terminal state together
///   with its final log entry
///
/// Task updates are guarded: once a task is terminal, `advance_progress` and
/// `finish_task` leave it untouched.
#[async_trait]
pub trait Store: Send + Sync {
    // Hosts ------------------------------------------------------------------

    async fn create_host(&self, host: NewHost) -> StoreResult<Host>;

    async fn get_host(&self, id: HostId) -> StoreResult<Option<Host>>;

    async fn list_hosts(&self) -> StoreResult<Vec<Host>>;

    /// Write back the poller-owned fields of a host
    async fn update_host_health(&self, id: HostId, health: HostHealth) -> StoreResult<()>;

    async fn delete_host(&self, id: HostId) -> StoreResult<bool>;

    // Metric samples -----------------------------------------------------------

    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<()>;

    /// Most recent samples for a host, newest first
    async fn latest_samples(&self, host_id: HostId, limit: usize)
    -> StoreResult<Vec<MetricSample>>;

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    // Domains ------------------------------------------------------------------

    async fn create_domain(&self, domain: NewDomain) -> StoreResult<Domain>;

    async fn get_domain(&self, id: DomainId) -> StoreResult<Option<Domain>>;

    async fn list_domains(&self) -> StoreResult<Vec<Domain>>;

    async fn delete_domain(&self, id: DomainId) -> StoreResult<bool>;

    /// Append to the NS check log and stamp the domain's `last_checked_at`
    async fn record_ns_check(&self, check: NewNsCheck) -> StoreResult<NsCheckResult>;

    /// NS check history for a domain, newest first
    async fn ns_checks(&self, domain_id: DomainId, limit: usize)
    -> StoreResult<Vec<NsCheckResult>>;

    // Hysteresis ---------------------------------------------------------------

    /// Current open/closed state of a key (`false` when never seen)
    async fn alert_key_is_open(&self, key: &AlertKey) -> StoreResult<bool>;

    /// Atomically apply one hysteresis step
    ///
    /// Returns `Some(new_state)` when the key flipped, `None` when the signal
    /// matched the stored state.
    async fn transition_alert_key(&self, key: &AlertKey, breaching: bool)
    -> StoreResult<Option<bool>>;

    /// Apply one hysteresis step and, if the key flipped, insert `alert` in the
    /// same atomic unit
    ///
    /// Either both the flip and the alert row are stored or neither is.
    async fn transition_alert_key_and_record(
        &self,
        key: &AlertKey,
        breaching: bool,
        alert: NewAlert,
    ) -> StoreResult<Option<Alert>>;

    // Alerts -------------------------------------------------------------------

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<Alert>;

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>>;

    /// Alerts matching the filter, newest first
    async fn list_alerts(&self, filter: &AlertFilter) -> StoreResult<Vec<Alert>>;

    async fn mark_alert_notified(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Mark an alert resolved. Returns `None` if it does not exist.
    async fn resolve_alert(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<Option<Alert>>;

    /// Unresolved alerts that were never delivered, oldest first
    async fn undelivered_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>>;

    // Tasks --------------------------------------------------------------------

    async fn create_task(&self, task: NewTask) -> StoreResult<Task>;

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// Tasks matching the filter, newest first
    async fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;

    async fn task_stats(&self) -> StoreResult<TaskStats>;

    /// Move a pending task to running. Returns `false` if it was not pending.
    async fn start_task(&self, id: TaskId, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Raise progress to `progress` if it is higher and the task is running
    ///
    /// Returns the stored progress afterwards, or `None` if the task is not running.
    async fn advance_progress(&self, id: TaskId, progress: u8) -> StoreResult<Option<u8>>;

    /// Terminal transition of a running task
    ///
    /// Returns `None` when the task was not running, in which case nothing changed.
    async fn finish_task(
        &self,
        id: TaskId,
        outcome: TaskOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<FinishedTask>>;

    /// Delete a task and its logs unless it is still pending or running
    async fn delete_task(&self, id: TaskId) -> StoreResult<TaskDeletion>;

    async fn append_task_log(&self, task_id: TaskId, entry: NewLogEntry)
    -> StoreResult<TaskLogEntry>;

    /// Log entries with id greater than `after`, in id order
    async fn task_logs(&self, task_id: TaskId, after: LogId) -> StoreResult<Vec<TaskLogEntry>>;

    // Retention ----------------------------------------------------------------

    /// Delete log entries older than `cutoff` that belong to terminal tasks
    async fn delete_task_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete completed tasks (and their logs) finished before `cutoff`
    async fn delete_completed_tasks_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<HealthStatus>;
}
