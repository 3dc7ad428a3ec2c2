//! Live task log stream
//!
//! The task engine publishes every stored log entry and every status change to
//! a per-task broadcast channel. A subscriber:
//!
//! 1. subscribes to the channel,
//! 2. reads the task's status, then replays stored entries after its cursor,
//! 3. emits the status snapshot,
//! 4. forwards live events, dropping entries it already replayed,
//! 5. ends after the first terminal status.
//!
//! Subscribing before reading the store means nothing published in between is
//! lost, and the cursor means nothing is delivered twice. A subscriber that
//! lags behind the channel catches up from the store again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, trace, warn};

use crate::model::{LogId, LogLevel, Task, TaskId, TaskLogEntry, TaskStatus};
use crate::storage::{Store, StoreResult};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub id: LogId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_code: Option<i32>,
}

impl From<&TaskLogEntry> for LogEvent {
    fn from(entry: &TaskLogEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            level: entry.level,
            source: entry.source.clone(),
            message: entry.message.clone(),
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
            return_code: entry.return_code,
        }
    }
}

/// Serialized as `{"type":"status","status":"Running","progress":30,"error_message":null}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "status")]
pub struct StatusEvent {
    pub status: TaskStatus,
    pub progress: u8,
    pub error_message: Option<String>,
}

impl From<&Task> for StatusEvent {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            progress: task.progress,
            error_message: task.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Log(LogEvent),
    Status(StatusEvent),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Status(status) if status.status.is_terminal())
    }
}

/// Per-task publish/subscribe hub
#[derive(Clone)]
pub struct LogHub {
    store: Arc<dyn Store>,
    channels: Arc<Mutex<HashMap<TaskId, broadcast::Sender<StreamEvent>>>>,
}

impl LogHub {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a stored log entry. A no-op when nobody is listening.
    pub async fn publish_log(&self, entry: &TaskLogEntry) {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(&entry.task_id) {
            let _ = sender.send(StreamEvent::Log(entry.into()));
        }
    }

    /// Publish a progress milestone of a running task
    pub async fn publish_progress(&self, task_id: TaskId, progress: u8) {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(&task_id) {
            let _ = sender.send(StreamEvent::Status(StatusEvent {
                status: TaskStatus::Running,
                progress,
                error_message: None,
            }));
        }
    }

    /// Publish a status change. The channel is dropped after a terminal status.
    pub async fn publish_status(&self, task: &Task) {
        let mut channels = self.channels.lock().await;
        if let Some(sender) = channels.get(&task.id) {
            let receivers = sender.send(StreamEvent::Status(task.into())).unwrap_or(0);
            trace!("published status of task {} to {} receivers", task.id, receivers);
        }
        if task.status.is_terminal() && channels.remove(&task.id).is_some() {
            debug!("closed log channel of task {}", task.id);
        }
    }

    async fn receiver(&self, task_id: TaskId) -> broadcast::Receiver<StreamEvent> {
        self.channels
            .lock()
            .await
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a channel nobody listens to
    async fn release(&self, task_id: TaskId) {
        let mut channels = self.channels.lock().await;
        if channels
            .get(&task_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(&task_id);
        }
    }

    #[cfg(test)]
    async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Stream a task's log from `after` (exclusive). `None` if the task does not exist.
    pub async fn subscribe(
        &self,
        task_id: TaskId,
        after: LogId,
    ) -> StoreResult<Option<impl Stream<Item = StreamEvent> + Send + 'static + use<>>> {
        let rx = self.receiver(task_id).await;

        let mut state = Subscription {
            store: self.store.clone(),
            task_id,
            cursor: after,
            queue: VecDeque::new(),
            rx: Some(rx),
            finished: false,
        };

        let found = match state.catch_up().await {
            Ok(found) => found,
            Err(e) => {
                state.rx = None;
                self.release(task_id).await;
                return Err(e);
            }
        };

        if !found || state.finished {
            state.rx = None;
            self.release(task_id).await;
        }
        if !found {
            return Ok(None);
        }

        Ok(Some(futures::stream::unfold(state, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        })))
    }
}

struct Subscription {
    store: Arc<dyn Store>,
    task_id: TaskId,
    cursor: LogId,
    queue: VecDeque<StreamEvent>,
    rx: Option<broadcast::Receiver<StreamEvent>>,
    finished: bool,
}

impl Subscription {
    /// Queue stored entries after the cursor followed by a status snapshot.
    /// Returns false if the task does not exist.
    async fn catch_up(&mut self) -> StoreResult<bool> {
        // Status first: once it reads terminal, every entry is already stored
        let Some(task) = self.store.get_task(self.task_id).await? else {
            return Ok(false);
        };

        for entry in self.store.task_logs(self.task_id, self.cursor).await? {
            self.cursor = self.cursor.max(entry.id);
            self.queue.push_back(StreamEvent::Log((&entry).into()));
        }

        self.queue.push_back(StreamEvent::Status((&task).into()));
        if task.status.is_terminal() {
            self.finished = true;
        }
        Ok(true)
    }

    async fn recover(&mut self) {
        match self.catch_up().await {
            Ok(true) => {}
            Ok(false) => self.finished = true,
            Err(e) => {
                warn!("failed to replay task {} log: {:#}", self.task_id, e);
                self.finished = true;
            }
        }
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.finished {
                self.rx = None;
                return None;
            }

            let Some(rx) = self.rx.as_mut() else {
                return None;
            };

            match rx.recv().await {
                Ok(StreamEvent::Log(log)) => {
                    if log.id > self.cursor {
                        self.cursor = log.id;
                        self.queue.push_back(StreamEvent::Log(log));
                    }
                }
                Ok(status @ StreamEvent::Status(_)) => {
                    self.finished = status.is_terminal();
                    self.queue.push_back(status);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("subscriber of task {} lagged by {}", self.task_id, skipped);
                    self.recover().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    self.recover().await;
                    self.finished = true;
                }
            }
        }
    }
}
