//! Shared fixtures: hosts, a scripted SSH connector and a scripted resolver

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwarden::dns::{NameResolver, RecordType, ResolveError};
use fleetwarden::model::{Credential, MetricsEndpoint, NewHost, Task, TaskId, TaskStatus};
use fleetwarden::remote::{CommandOutput, RemoteConnector, RemoteError, RemoteSession, RemoteTarget};
use fleetwarden::storage::{MemoryStore, Store};
use fleetwarden::stream::LogHub;
use fleetwarden::tasks::{StepTimeouts, TaskEngine};
use tokio::sync::Notify;
use wiremock::MockServer;

pub fn new_host(name: &str) -> NewHost {
    NewHost {
        name: name.to_string(),
        address: "192.0.2.10".to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        credential: Credential::Password {
            password: "hunter2".to_string(),
        },
        metrics: MetricsEndpoint::default(),
    }
}

/// Host whose metrics endpoint points at the mock server
pub fn host_on_mock(name: &str, server: &MockServer) -> NewHost {
    let uri = url::Url::parse(&server.uri()).unwrap();
    let mut host = new_host(name);
    host.address = uri.host_str().unwrap().to_string();
    host.metrics.port = uri.port().unwrap();
    host
}

pub fn snapshot_json(cpu: f64, mem: f64, disk: f64) -> serde_json::Value {
    serde_json::json!({
        "cpu": { "total": cpu },
        "mem": { "percent": mem },
        "fs": [ { "mnt_point": "/", "percent": disk } ],
        "load": { "min1": 0.5, "min5": 0.4, "min15": 0.3 },
        "uptime": "1 day, 2:03:04"
    })
}

/// Answers commands by substring match. Unmatched commands succeed with no output.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    replies: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    executed: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<(String, String)>>>,
    refuse: Arc<Mutex<Option<String>>>,
    gate: Arc<Mutex<Option<Arc<Notify>>>>,
    disconnects: Arc<Mutex<usize>>,
}

impl ScriptedConnector {
    pub fn reply(&self, pattern: &str, return_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.replies.lock().unwrap().push((
            pattern.to_string(),
            CommandOutput {
                return_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn refuse_connections(&self, reason: &str) {
        *self.refuse.lock().unwrap() = Some(reason.to_string());
    }

    /// Block every command until the returned handle is notified
    pub fn hold_commands(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        *self.disconnects.lock().unwrap()
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if let Some(reason) = self.refuse.lock().unwrap().clone() {
            return Err(RemoteError::Connect {
                target: target.to_string(),
                reason,
            });
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl RemoteSession for ScriptedConnector {
    async fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, RemoteError> {
        self.executed.lock().unwrap().push(command.to_string());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn upload(&mut self, content: &str, remote_path: &str) -> Result<(), RemoteError> {
        self.uploads
            .lock()
            .unwrap()
            .push((remote_path.to_string(), content.to_string()));
        Ok(())
    }

    async fn disconnect(self: Box<Self>) {
        *self.disconnects.lock().unwrap() += 1;
    }
}

/// Resolver answering from a fixed table
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Result<Vec<String>, ResolveError>>>,
}

impl ScriptedResolver {
    pub fn answer(&self, name: &str, answer: Result<Vec<&str>, ResolveError>) {
        self.answers.lock().unwrap().insert(
            name.to_string(),
            answer.map(|records| records.into_iter().map(String::from).collect()),
        );
    }
}

#[async_trait]
impl NameResolver for ScriptedResolver {
    async fn resolve(
        &self,
        name: &str,
        _record_type: RecordType,
        _servers: &[String],
        _timeout: Duration,
    ) -> Result<Vec<String>, ResolveError> {
        self.answers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(Err(ResolveError::NxDomain))
    }
}

pub fn engine_with(store: Arc<dyn Store>, connector: &ScriptedConnector) -> TaskEngine {
    TaskEngine::new(
        store.clone(),
        LogHub::new(store),
        Arc::new(connector.clone()),
        StepTimeouts::default(),
    )
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

pub async fn wait_for_status(engine: &TaskEngine, id: TaskId, status: TaskStatus) -> Task {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = engine.get(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status:?}"))
}

pub async fn wait_until_finished(engine: &TaskEngine, id: TaskId) -> Task {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = engine.get(id).await.unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never finished"))
}
