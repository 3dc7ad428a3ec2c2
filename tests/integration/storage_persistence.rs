//! Integration tests for the SQLite store
//!
//! These tests verify that:
//! - Hosts, alert key state and tasks survive a reopen
//! - Terminal task transitions are guarded
//! - Deleting a task cascades to its log
//! - Retention deletes only what is past its cutoff
//! - A hysteresis flip is never stored without its alert
//! - A task whose outcome cannot be stored is still closed

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use fleetwarden::actors::Alerting;
use fleetwarden::hysteresis::{Signal, ThresholdEngine, is_breaching};
use fleetwarden::ledger::AlertLedger;
use fleetwarden::model::{
    AlertFilter, AlertKey, AlertKind, AlertLevel, HostHealth, LogLevel, NewLogEntry, NewTask,
    Reachability, TaskDeletion, TaskKind, TaskOutcome, TaskStatus,
};
use fleetwarden::storage::Store;
use fleetwarden::storage::sqlite::SqliteStore;
use fleetwarden::tasks::TaskRequest;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;

use crate::helpers::{ScriptedConnector, engine_with, new_host, wait_until_finished};

fn new_task(created_at: chrono::DateTime<Utc>) -> NewTask {
    NewTask {
        name: "Deploy proxy on web-1".to_string(),
        kind: TaskKind::DeployProxy,
        host_id: None,
        domain_id: None,
        params: json!({}),
        created_at,
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");

    let (host_id, task_id) = {
        let store = SqliteStore::new(&db_path, 2).await.unwrap();
        let host = store.create_host(new_host("web-1")).await.unwrap();
        store
            .update_host_health(
                host.id,
                HostHealth {
                    reachability: Reachability::Unreachable,
                    consecutive_failures: 4,
                    last_checked_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let key = AlertKey::host(host.id, AlertKind::Unreachable);
        assert_eq!(store.transition_alert_key(&key, true).await.unwrap(), Some(true));

        let task = store.create_task(new_task(Utc::now())).await.unwrap();
        store.start_task(task.id, Utc::now()).await.unwrap();
        store
            .append_task_log(task.id, NewLogEntry::new(LogLevel::Info, "ssh", "Connected"))
            .await
            .unwrap();
        (host.id, task.id)
    };

    let store = SqliteStore::new(&db_path, 2).await.unwrap();

    let host = store.get_host(host_id).await.unwrap().unwrap();
    assert_eq!(host.reachability, Reachability::Unreachable);
    assert_eq!(host.consecutive_failures, 4);
    assert_eq!(host.credential, new_host("web-1").credential);

    let key = AlertKey::host(host_id, AlertKind::Unreachable);
    assert!(store.alert_key_is_open(&key).await.unwrap());
    assert_eq!(store.transition_alert_key(&key, true).await.unwrap(), None);

    let task = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(store.task_logs(task_id, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_tasks_are_frozen() {
    let dir = tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("fleet.db"), 2).await.unwrap();

    let task = store.create_task(new_task(Utc::now())).await.unwrap();
    assert!(store.start_task(task.id, Utc::now()).await.unwrap());
    assert!(!store.start_task(task.id, Utc::now()).await.unwrap());

    assert_eq!(store.advance_progress(task.id, 40).await.unwrap(), Some(40));
    assert_eq!(store.advance_progress(task.id, 20).await.unwrap(), Some(40));

    let finished = store
        .finish_task(
            task.id,
            TaskOutcome::Failed {
                error: "nginx -t failed".to_string(),
                log: NewLogEntry::new(LogLevel::Error, "task", "Task failed: nginx -t failed"),
            },
            Utc::now(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.task.status, TaskStatus::Failed);
    assert_eq!(finished.task.progress, 40);
    assert!(finished.final_log.is_some());

    assert_eq!(store.advance_progress(task.id, 90).await.unwrap(), None);
    let again = store
        .finish_task(
            task.id,
            TaskOutcome::Completed { result: json!({}) },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(again, None);

    let stored = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.progress, 40);
    assert_eq!(stored.error_message.as_deref(), Some("nginx -t failed"));
}

#[tokio::test]
async fn test_delete_cascades_and_rejects_running() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::new(dir.path().join("fleet.db"), 2).await.unwrap());

    let task = store.create_task(new_task(Utc::now())).await.unwrap();
    store.start_task(task.id, Utc::now()).await.unwrap();
    store
        .append_task_log(task.id, NewLogEntry::new(LogLevel::Info, "ssh", "Connected"))
        .await
        .unwrap();

    assert_matches!(
        store.delete_task(task.id).await.unwrap(),
        TaskDeletion::InProgress(TaskStatus::Running)
    );

    store
        .finish_task(task.id, TaskOutcome::Completed { result: json!({}) }, Utc::now())
        .await
        .unwrap();
    assert_eq!(store.delete_task(task.id).await.unwrap(), TaskDeletion::Deleted);
    assert!(store.task_logs(task.id, 0).await.unwrap().is_empty());
    assert_eq!(store.delete_task(task.id).await.unwrap(), TaskDeletion::NotFound);
}

#[tokio::test]
async fn test_retention_only_removes_expired_completed_tasks() {
    let dir = tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("fleet.db"), 2).await.unwrap();
    let old = Utc::now() - Duration::days(10);

    let completed = store.create_task(new_task(old)).await.unwrap();
    store.start_task(completed.id, old).await.unwrap();
    store
        .finish_task(completed.id, TaskOutcome::Completed { result: json!({}) }, old)
        .await
        .unwrap();

    let failed = store.create_task(new_task(old)).await.unwrap();
    store.start_task(failed.id, old).await.unwrap();
    store
        .finish_task(
            failed.id,
            TaskOutcome::Failed {
                error: "boom".to_string(),
                log: NewLogEntry::new(LogLevel::Error, "task", "Task failed: boom"),
            },
            old,
        )
        .await
        .unwrap();

    let recent = store.create_task(new_task(Utc::now())).await.unwrap();

    let cutoff = Utc::now() - Duration::days(7);
    assert_eq!(store.delete_completed_tasks_before(cutoff).await.unwrap(), 1);

    assert!(store.get_task(completed.id).await.unwrap().is_none());
    assert!(store.get_task(failed.id).await.unwrap().is_some());
    assert!(store.get_task(recent.id).await.unwrap().is_some());

    let health = store.health_check().await.unwrap();
    assert!(health.healthy);
}

fn cpu_signal(host_id: i64, value: f64) -> Signal {
    Signal {
        key: AlertKey::host(host_id, AlertKind::CpuHigh),
        breaching: is_breaching(value, 85.0),
        subject: "web-1".to_string(),
        detail: format!("CPU usage at {value:.1}% (threshold 85%)"),
    }
}

#[tokio::test]
async fn test_failed_alert_write_leaves_key_closed() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&db_path, 2).await.unwrap());
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let alerting = Alerting::new(
        ThresholdEngine::new(store.clone()),
        AlertLedger::new(store.clone(), None),
    );

    let admin = sqlx::SqlitePool::connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_alerts BEFORE INSERT ON alerts \
         BEGIN SELECT RAISE(ABORT, 'alerts are read-only'); END",
    )
    .execute(&admin)
    .await
    .unwrap();

    assert!(alerting.signal(&cpu_signal(host.id, 90.0)).await.is_err());
    let key = AlertKey::host(host.id, AlertKind::CpuHigh);
    assert!(!store.alert_key_is_open(&key).await.unwrap());

    sqlx::query("DROP TRIGGER reject_alerts")
        .execute(&admin)
        .await
        .unwrap();

    let alert = alerting.signal(&cpu_signal(host.id, 92.0)).await.unwrap().unwrap();
    assert_eq!(alert.level, AlertLevel::Warning);
    assert!(alerting.signal(&cpu_signal(host.id, 95.0)).await.unwrap().is_none());

    assert!(store.alert_key_is_open(&key).await.unwrap());
    assert_eq!(store.list_alerts(&AlertFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_task_is_closed_when_its_outcome_cannot_be_stored() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("fleet.db");
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&db_path, 2).await.unwrap());
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.reply("echo 'SSH test successful'", 0, "SSH test successful\n", "");
    let engine = engine_with(store.clone(), &connector);

    let admin = sqlx::SqlitePool::connect(&format!("sqlite://{}", db_path.display()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_completion BEFORE UPDATE OF status ON tasks \
         WHEN NEW.status = 'completed' \
         BEGIN SELECT RAISE(ABORT, 'completion rejected'); END",
    )
    .execute(&admin)
    .await
    .unwrap();

    let task = engine
        .submit(TaskRequest::new(TaskKind::SshCheck).on_host(host.id))
        .await
        .unwrap();
    let task = wait_until_finished(&engine, task.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.error_message
            .as_deref()
            .unwrap()
            .starts_with("task outcome could not be recorded")
    );
    let logs = store.task_logs(task.id, 0).await.unwrap();
    assert!(logs.last().unwrap().message.starts_with("Task failed:"));
}
