//! Remote provisioning task engine
//!
//! ## Lifecycle
//!
//! ```text
//! submit ─▶ Pending ─▶ Running ─┬─▶ Completed
//!                               └─▶ Failed
//! ```
//!
//! `submit` persists the task and returns at once. The job runs on its own
//! tokio task and every transition goes through the guarded store updates,
//! so nothing can move a task out of a terminal state. Cancellation is
//! cooperative: the job stops at its next milestone and steps already applied
//! on the host stay applied.

pub mod context;
pub mod export;
pub mod jobs;
pub mod templates;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{
    Domain, DomainId, Host, HostId, LogId, LogLevel, NewLogEntry, NewTask, Task, TaskDeletion,
    TaskFilter, TaskId, TaskKind, TaskLogEntry, TaskOutcome, TaskStats, TaskStatus,
};
use crate::remote::RemoteConnector;
use crate::storage::{Store, StoreError};
use crate::stream::LogHub;

use context::{Cancelled, JobContext};
pub use context::StepTimeouts;
use jobs::JobInput;

pub const CANCELLED_MESSAGE: &str = "task cancelled";
const INTERRUPTED_MESSAGE: &str = "task interrupted by hub restart";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task in progress")]
    InProgress(TaskStatus),

    #[error("task already {0}")]
    AlreadyFinished(TaskStatus),

    #[error("invalid task request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a task submission
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub kind: TaskKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host_id: Option<HostId>,
    #[serde(default)]
    pub domain_id: Option<DomainId>,
    #[serde(default)]
    pub params: Value,
}

impl TaskRequest {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            name: None,
            host_id: None,
            domain_id: None,
            params: Value::Null,
        }
    }

    pub fn on_host(mut self, host_id: HostId) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn for_domain(mut self, domain_id: DomainId) -> Self {
        self.domain_id = Some(domain_id);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

fn default_name(kind: TaskKind, host: &Host, domain: Option<&Domain>) -> String {
    match (kind, domain) {
        (TaskKind::SshCheck, _) => format!("SSH check on {}", host.name),
        (TaskKind::DeployProxy, _) => format!("Deploy proxy on {}", host.name),
        (TaskKind::InstallAgent, _) => format!("Install agent on {}", host.name),
        (TaskKind::DeployDomain, Some(domain)) => {
            format!("Deploy {} on {}", domain.name, host.name)
        }
        (TaskKind::DeployDomain, None) => format!("Deploy domain on {}", host.name),
    }
}

#[derive(Clone)]
pub struct TaskEngine {
    store: Arc<dyn Store>,
    hub: LogHub,
    connector: Arc<dyn RemoteConnector>,
    timeouts: StepTimeouts,
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn Store>,
        hub: LogHub,
        connector: Arc<dyn RemoteConnector>,
        timeouts: StepTimeouts,
    ) -> Self {
        Self {
            store,
            hub,
            connector,
            timeouts,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    async fn resolve_subjects(
        &self,
        request: &TaskRequest,
    ) -> Result<(Host, Option<Domain>), TaskError> {
        let domain = match (request.kind, request.domain_id) {
            (TaskKind::DeployDomain, None) => {
                return Err(TaskError::Invalid("deploy_domain requires domain_id".to_string()));
            }
            (TaskKind::DeployDomain, Some(id)) => Some(
                self.store
                    .get_domain(id)
                    .await?
                    .ok_or_else(|| TaskError::Invalid(format!("domain {id} not found")))?,
            ),
            _ => None,
        };

        let host_id = request
            .host_id
            .or(domain.as_ref().and_then(|d| d.host_id))
            .ok_or_else(|| {
                TaskError::Invalid(format!("{} requires host_id", request.kind))
            })?;

        let host = self
            .store
            .get_host(host_id)
            .await?
            .ok_or_else(|| TaskError::Invalid(format!("host {host_id} not found")))?;

        Ok((host, domain))
    }

    /// Persist a Pending task and start it in the background
    #[instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn submit(&self, request: TaskRequest) -> Result<Task, TaskError> {
        let (host, domain) = self.resolve_subjects(&request).await?;

        let params = match request.params {
            Value::Null => Value::Object(Default::default()),
            params => params,
        };

        let task = self
            .store
            .create_task(NewTask {
                name: request
                    .name
                    .unwrap_or_else(|| default_name(request.kind, &host, domain.as_ref())),
                kind: request.kind,
                host_id: Some(host.id),
                domain_id: domain.as_ref().map(|d| d.id),
                params,
                created_at: Utc::now(),
            })
            .await?;

        let token = CancellationToken::new();
        self.tokens.lock().await.insert(task.id, token.clone());

        info!("submitted task {}: {}", task.id, task.name);
        tokio::spawn(self.clone().execute(task.clone(), token, host, domain));

        Ok(task)
    }

    #[instrument(skip_all, fields(task = task.id))]
    async fn execute(self, task: Task, token: CancellationToken, host: Host, domain: Option<Domain>) {
        if let Err(e) = self.drive(&task, &token, &host, domain.as_ref()).await {
            error!("failed to record task outcome: {:#}", e);
            let reason = format!("task outcome could not be recorded: {e:#}");
            if let Err(e) = self.abandon(&task, &reason).await {
                error!("failed to close task {}: {:#}", task.id, e);
            }
        }
        self.tokens.lock().await.remove(&task.id);
    }

    async fn drive(
        &self,
        task: &Task,
        token: &CancellationToken,
        host: &Host,
        domain: Option<&Domain>,
    ) -> anyhow::Result<()> {
        if !self.store.start_task(task.id, Utc::now()).await? {
            debug!("task is no longer pending");
            return Ok(());
        }
        if let Some(running) = self.store.get_task(task.id).await? {
            self.hub.publish_status(&running).await;
        }

        let ctx = JobContext::new(
            self.store.clone(),
            self.hub.clone(),
            task.id,
            token.clone(),
            self.timeouts,
        );

        let result = match ctx.checkpoint() {
            Ok(()) => {
                jobs::run(
                    &ctx,
                    self.connector.as_ref(),
                    JobInput {
                        kind: task.kind,
                        host,
                        domain,
                        params: &task.params,
                    },
                )
                .await
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(result) => TaskOutcome::Completed { result },
            Err(e) => {
                let error = if e.is::<Cancelled>() {
                    CANCELLED_MESSAGE.to_string()
                } else {
                    format!("{e:#}")
                };
                warn!("task failed: {}", error);
                TaskOutcome::Failed {
                    log: NewLogEntry::new(LogLevel::Error, "task", format!("Task failed: {error}")),
                    error,
                }
            }
        };

        self.finish(task.id, outcome).await?;
        Ok(())
    }

    async fn finish(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        match self.store.finish_task(id, outcome, Utc::now()).await? {
            Some(finished) => {
                if let Some(log) = &finished.final_log {
                    self.hub.publish_log(log).await;
                }
                self.hub.publish_status(&finished.task).await;
                info!("task {} {}", id, finished.task.status);
            }
            None => warn!("task {} was not running, outcome dropped", id),
        }
        Ok(())
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound(id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    pub async fn stats(&self) -> Result<TaskStats, TaskError> {
        Ok(self.store.task_stats().await?)
    }

    pub async fn logs(&self, id: TaskId, after: LogId) -> Result<Vec<TaskLogEntry>, TaskError> {
        self.get(id).await?;
        Ok(self.store.task_logs(id, after).await?)
    }

    pub async fn export(&self, id: TaskId) -> Result<String, TaskError> {
        let task = self.get(id).await?;
        let logs = self.store.task_logs(id, 0).await?;
        Ok(export::render(&task, &logs))
    }

    /// Delete a finished task together with its log
    pub async fn delete(&self, id: TaskId) -> Result<(), TaskError> {
        match self.store.delete_task(id).await? {
            TaskDeletion::Deleted => {
                debug!("deleted task {}", id);
                Ok(())
            }
            TaskDeletion::NotFound => Err(TaskError::NotFound(id)),
            TaskDeletion::InProgress(status) => Err(TaskError::InProgress(status)),
        }
    }

    /// Request cancellation. The task ends Failed at its next checkpoint.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        let task = self.get(id).await?;
        if task.status.is_terminal() {
            return Err(TaskError::AlreadyFinished(task.status));
        }

        let token = self.tokens.lock().await.get(&id).cloned();
        match token {
            Some(token) => {
                info!("cancelling task {}", id);
                token.cancel();
            }
            None => {
                // Nothing runs this task in this process
                self.abandon(&task, CANCELLED_MESSAGE).await?;
            }
        }

        self.get(id).await
    }

    async fn abandon(&self, task: &Task, reason: &str) -> Result<(), StoreError> {
        if task.status == TaskStatus::Pending {
            self.store.start_task(task.id, Utc::now()).await?;
        }
        self.finish(
            task.id,
            TaskOutcome::Failed {
                error: reason.to_string(),
                log: NewLogEntry::new(LogLevel::Error, "task", format!("Task failed: {reason}")),
            },
        )
        .await
    }

    /// Fail tasks left Pending or Running by a previous process
    pub async fn fail_orphaned(&self) -> Result<usize, TaskError> {
        let mut orphaned = 0;
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            let tasks = self
                .store
                .list_tasks(&TaskFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?;

            for task in tasks {
                if self.tokens.lock().await.contains_key(&task.id) {
                    continue;
                }
                match self.abandon(&task, INTERRUPTED_MESSAGE).await {
                    Ok(()) => orphaned += 1,
                    Err(e) => error!("failed to close orphaned task {}: {:#}", task.id, e),
                }
            }
        }

        if orphaned > 0 {
            warn!("marked {} orphaned tasks as failed", orphaned);
        }
        Ok(orphaned)
    }
}
