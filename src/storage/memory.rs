//! In-memory store (no persistence)
//!
//! Keeps every entity in ordinary collections behind one mutex. Used when the
//! configuration selects `"backend": "none"` and throughout the test suite.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Single process**: The hysteresis state is only durable for the lifetime of the process

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{HealthStatus, Store};
use super::error::{StoreError, StoreResult};
use crate::model::{
    Alert, AlertFilter, AlertId, AlertKey, Domain, DomainId, FinishedTask, Host, HostHealth,
    HostId, LogId, MetricSample, NewAlert, NewDomain, NewHost, NewLogEntry, NewNsCheck, NewTask,
    NsCheckResult, Reachability, Task, TaskDeletion, TaskFilter, TaskId, TaskLogEntry,
    TaskOutcome, TaskStats, TaskStatus,
};

#[derive(Default)]
struct Inner {
    hosts: BTreeMap<HostId, Host>,
    samples: Vec<MetricSample>,
    domains: BTreeMap<DomainId, Domain>,
    ns_checks: Vec<NsCheckResult>,
    alert_keys: HashMap<AlertKey, bool>,
    alerts: BTreeMap<AlertId, Alert>,
    tasks: BTreeMap<TaskId, Task>,
    logs: BTreeMap<LogId, TaskLogEntry>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_alert(&mut self, alert: NewAlert) -> Alert {
        let id = self.next_id();
        let alert = Alert {
            id,
            level: alert.level,
            title: alert.title,
            message: alert.message,
            alert_kind: alert.key.alert_kind,
            subject_kind: alert.key.subject_kind,
            subject_id: alert.key.subject_id,
            is_resolved: false,
            resolved_at: None,
            notified_at: None,
            created_at: alert.created_at,
        };
        self.alerts.insert(id, alert.clone());
        alert
    }

    fn push_log(&mut self, task_id: TaskId, entry: NewLogEntry) -> TaskLogEntry {
        let id = self.next_id();
        let log = TaskLogEntry {
            id,
            task_id,
            timestamp: entry.timestamp,
            level: entry.level,
            source: entry.source,
            message: entry.message,
            stdout: entry.stdout,
            stderr: entry.stderr,
            return_code: entry.return_code,
        };
        self.logs.insert(id, log.clone());
        log
    }

    fn remove_task(&mut self, id: TaskId) {
        self.tasks.remove(&id);
        self.logs.retain(|_, log| log.task_id != id);
    }
}

/// In-memory implementation of [`Store`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_host(&self, host: NewHost) -> StoreResult<Host> {
        let mut inner = self.inner.lock().await;
        if inner.hosts.values().any(|h| h.name == host.name) {
            return Err(StoreError::Conflict(format!("host '{}'", host.name)));
        }

        let id = inner.next_id();
        let host = Host {
            id,
            name: host.name,
            address: host.address,
            ssh_port: host.ssh_port,
            ssh_user: host.ssh_user,
            credential: host.credential,
            metrics: host.metrics,
            reachability: Reachability::Provisioning,
            consecutive_failures: 0,
            last_checked_at: None,
            created_at: Utc::now(),
        };
        inner.hosts.insert(id, host.clone());
        Ok(host)
    }

    async fn get_host(&self, id: HostId) -> StoreResult<Option<Host>> {
        Ok(self.inner.lock().await.hosts.get(&id).cloned())
    }

    async fn list_hosts(&self) -> StoreResult<Vec<Host>> {
        Ok(self.inner.lock().await.hosts.values().cloned().collect())
    }

    async fn update_host_health(&self, id: HostId, health: HostHealth) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let host = inner.hosts.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "host",
            id,
        })?;
        host.reachability = health.reachability;
        host.consecutive_failures = health.consecutive_failures;
        host.last_checked_at = Some(health.last_checked_at);
        Ok(())
    }

    async fn delete_host(&self, id: HostId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner.hosts.remove(&id).is_some();
        inner.samples.retain(|s| s.host_id != id);
        Ok(existed)
    }

    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<()> {
        self.inner.lock().await.samples.push(sample.clone());
        Ok(())
    }

    async fn latest_samples(
        &self,
        host_id: HostId,
        limit: usize,
    ) -> StoreResult<Vec<MetricSample>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .samples
            .iter()
            .rev()
            .filter(|s| s.host_id == host_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.samples.len();
        inner.samples.retain(|s| s.taken_at >= cutoff);
        let removed = (before - inner.samples.len()) as u64;
        debug!("removed {} metric samples from memory", removed);
        Ok(removed)
    }

    async fn create_domain(&self, domain: NewDomain) -> StoreResult<Domain> {
        let mut inner = self.inner.lock().await;
        if inner.domains.values().any(|d| d.name == domain.name) {
            return Err(StoreError::Conflict(format!("domain '{}'", domain.name)));
        }

        let id = inner.next_id();
        let domain = Domain {
            id,
            name: domain.name,
            host_id: domain.host_id,
            ns_policy: domain.ns_policy,
            ssl: domain.ssl,
            upstream: domain.upstream,
            last_checked_at: None,
            created_at: Utc::now(),
        };
        inner.domains.insert(id, domain.clone());
        Ok(domain)
    }

    async fn get_domain(&self, id: DomainId) -> StoreResult<Option<Domain>> {
        Ok(self.inner.lock().await.domains.get(&id).cloned())
    }

    async fn list_domains(&self) -> StoreResult<Vec<Domain>> {
        Ok(self.inner.lock().await.domains.values().cloned().collect())
    }

    async fn delete_domain(&self, id: DomainId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let existed = inner.domains.remove(&id).is_some();
        inner.ns_checks.retain(|c| c.domain_id != id);
        Ok(existed)
    }

    async fn record_ns_check(&self, check: NewNsCheck) -> StoreResult<NsCheckResult> {
        let mut inner = self.inner.lock().await;
        let domain = inner
            .domains
            .get_mut(&check.domain_id)
            .ok_or(StoreError::NotFound {
                entity: "domain",
                id: check.domain_id,
            })?;
        domain.last_checked_at = Some(check.checked_at);

        let id = inner.next_id();
        let result = NsCheckResult {
            id,
            domain_id: check.domain_id,
            nameservers: check.nameservers,
            is_valid: check.is_valid,
            error: check.error,
            checked_at: check.checked_at,
        };
        inner.ns_checks.push(result.clone());
        Ok(result)
    }

    async fn ns_checks(
        &self,
        domain_id: DomainId,
        limit: usize,
    ) -> StoreResult<Vec<NsCheckResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ns_checks
            .iter()
            .rev()
            .filter(|c| c.domain_id == domain_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn alert_key_is_open(&self, key: &AlertKey) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.alert_keys.get(key).copied().unwrap_or(false))
    }

    async fn transition_alert_key(
        &self,
        key: &AlertKey,
        breaching: bool,
    ) -> StoreResult<Option<bool>> {
        let mut inner = self.inner.lock().await;
        let state = inner.alert_keys.entry(*key).or_insert(false);
        if *state == breaching {
            return Ok(None);
        }
        *state = breaching;
        Ok(Some(breaching))
    }

    async fn transition_alert_key_and_record(
        &self,
        key: &AlertKey,
        breaching: bool,
        alert: NewAlert,
    ) -> StoreResult<Option<Alert>> {
        let mut inner = self.inner.lock().await;
        let state = inner.alert_keys.entry(*key).or_insert(false);
        if *state == breaching {
            return Ok(None);
        }
        *state = breaching;
        Ok(Some(inner.push_alert(alert)))
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<Alert> {
        Ok(self.inner.lock().await.push_alert(alert))
    }

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        Ok(self.inner.lock().await.alerts.get(&id).cloned())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> StoreResult<Vec<Alert>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .alerts
            .values()
            .rev()
            .filter(|a| !filter.unresolved || !a.is_resolved)
            .filter(|a| filter.subject_id.is_none_or(|id| a.subject_id == id))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_alert_notified(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(alert) = inner.alerts.get_mut(&id) {
            alert.notified_at = Some(at);
        }
        Ok(())
    }

    async fn resolve_alert(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<Option<Alert>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.alerts.get_mut(&id).map(|alert| {
            if !alert.is_resolved {
                alert.is_resolved = true;
                alert.resolved_at = Some(at);
            }
            alert.clone()
        }))
    }

    async fn undelivered_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .alerts
            .values()
            .filter(|a| a.notified_at.is_none() && !a.is_resolved)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_task(&self, task: NewTask) -> StoreResult<Task> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        let task = Task {
            id,
            name: task.name,
            kind: task.kind,
            host_id: task.host_id,
            domain_id: task.domain_id,
            params: task.params,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error_message: None,
            created_at: task.created_at,
            started_at: None,
            completed_at: None,
        };
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .rev()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.kind.is_none_or(|k| t.kind == k))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn task_stats(&self) -> StoreResult<TaskStats> {
        let inner = self.inner.lock().await;
        let mut stats = TaskStats::default();
        for task in inner.tasks.values() {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn start_task(&self, id: TaskId, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_progress(&self, id: TaskId, progress: u8) -> StoreResult<Option<u8>> {
        let mut inner = self.inner.lock().await;
        match inner.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.progress = task.progress.max(progress.min(100));
                Ok(Some(task.progress))
            }
            _ => Ok(None),
        }
    }

    async fn finish_task(
        &self,
        id: TaskId,
        outcome: TaskOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<FinishedTask>> {
        let mut inner = self.inner.lock().await;
        let running = inner
            .tasks
            .get(&id)
            .is_some_and(|t| t.status == TaskStatus::Running);
        if !running {
            return Ok(None);
        }

        let final_log = match &outcome {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { log, .. } => Some(inner.push_log(id, log.clone())),
        };

        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        match outcome {
            TaskOutcome::Completed { result } => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.result = Some(result);
            }
            TaskOutcome::Failed { error, .. } => {
                task.status = TaskStatus::Failed;
                task.error_message = Some(error);
            }
        }
        task.completed_at = Some(at);

        Ok(Some(FinishedTask {
            task: task.clone(),
            final_log,
        }))
    }

    async fn delete_task(&self, id: TaskId) -> StoreResult<TaskDeletion> {
        let mut inner = self.inner.lock().await;
        let Some(status) = inner.tasks.get(&id).map(|t| t.status) else {
            return Ok(TaskDeletion::NotFound);
        };
        if !status.is_terminal() {
            return Ok(TaskDeletion::InProgress(status));
        }
        inner.remove_task(id);
        Ok(TaskDeletion::Deleted)
    }

    async fn append_task_log(
        &self,
        task_id: TaskId,
        entry: NewLogEntry,
    ) -> StoreResult<TaskLogEntry> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }
        Ok(inner.push_log(task_id, entry))
    }

    async fn task_logs(&self, task_id: TaskId, after: LogId) -> StoreResult<Vec<TaskLogEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .range(after.saturating_add(1)..)
            .map(|(_, log)| log)
            .filter(|log| log.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_task_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let Inner { tasks, logs, .. } = &mut *inner;
        let before = logs.len();
        logs.retain(|_, log| {
            let terminal = tasks
                .get(&log.task_id)
                .is_none_or(|t| t.status.is_terminal());
            !(terminal && log.timestamp < cutoff)
        });
        Ok((before - logs.len()) as u64)
    }

    async fn delete_completed_tasks_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| t.completed_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id)
            .collect();
        for id in &expired {
            inner.remove_task(*id);
        }
        Ok(expired.len() as u64)
    }

    async fn health_check(&self) -> StoreResult<HealthStatus> {
        let inner = self.inner.lock().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("hosts".to_string(), inner.hosts.len().to_string()),
                ("tasks".to_string(), inner.tasks.len().to_string()),
            ]),
        })
    }
}
