//! Provisioning tasks against a scripted SSH connector
//!
//! These tests verify that:
//! - Jobs run their steps in order and always disconnect
//! - A failing command fails the task with the command's stderr
//! - Delete and cancel respect the task lifecycle
//! - Orphaned tasks are failed at startup

use assert_matches::assert_matches;
use chrono::Utc;
use fleetwarden::model::{
    LogLevel, NewDomain, NewTask, TaskFilter, TaskKind, TaskStatus,
};
use fleetwarden::tasks::{CANCELLED_MESSAGE, TaskError, TaskRequest};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::{
    ScriptedConnector, engine_with, memory_store, new_host, wait_for_status, wait_until_finished,
};

#[tokio::test]
async fn test_ssh_check_completes() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.reply("echo 'SSH test successful'", 0, "SSH test successful\n", "");
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(TaskRequest::new(TaskKind::SshCheck).on_host(host.id))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.name, "SSH check on web-1");

    let task = wait_until_finished(&engine, task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(
        task.result,
        Some(json!({
            "success": true,
            "message": "SSH connection successful",
            "output": "SSH test successful",
        }))
    );
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert_eq!(connector.disconnects(), 1);
}

#[tokio::test]
async fn test_failing_marker_fails_with_stderr() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.reply("echo", 1, "", "Permission denied (publickey)");
    let engine = engine_with(store.clone(), &connector);

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
            .contains("Permission denied (publickey)")
    );
    assert!(task.progress < 100);
    assert_eq!(connector.disconnects(), 1);

    let logs = engine.logs(task.id, 0).await.unwrap();
    let executed = logs
        .iter()
        .find(|entry| entry.message.starts_with("Executed:"))
        .unwrap();
    assert_eq!(executed.level, LogLevel::Error);
    assert_eq!(executed.return_code, Some(1));
    assert_eq!(executed.stderr.as_deref(), Some("Permission denied (publickey)"));

    let last = logs.last().unwrap();
    assert_eq!(last.level, LogLevel::Error);
    assert!(last.message.starts_with("Task failed:"));

    let ids: Vec<i64> = logs.iter().map(|entry| entry.id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_connection_refused_fails_without_commands() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.refuse_connections("Connection refused");
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(TaskRequest::new(TaskKind::DeployProxy).on_host(host.id))
        .await
        .unwrap();
    let task = wait_until_finished(&engine, task.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("Connection refused"));
    assert!(connector.executed().is_empty());
    assert_eq!(connector.disconnects(), 0);
}

#[tokio::test]
async fn test_deploy_domain_uploads_site_and_issues_certificate() {
    let store = memory_store();
    let host = store.create_host(new_host("edge")).await.unwrap();
    let domain = store
        .create_domain(NewDomain {
            name: "shop.example.com".to_string(),
            host_id: Some(host.id),
            ns_policy: "dnspod".to_string(),
            ssl: false,
            upstream: Some("10.0.0.2:3000".to_string()),
        })
        .await
        .unwrap();
    let connector = ScriptedConnector::default();
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(
            TaskRequest::new(TaskKind::DeployDomain)
                .for_domain(domain.id)
                .with_params(json!({ "ssl": true })),
        )
        .await
        .unwrap();
    assert_eq!(task.host_id, Some(host.id));

    let task = wait_until_finished(&engine, task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(
        task.result,
        Some(json!({ "success": true, "domain": "shop.example.com", "ssl": true }))
    );

    let uploads = connector.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "/tmp/shop.example.com.conf");
    assert!(uploads[0].1.contains("server_name shop.example.com"));
    assert!(uploads[0].1.contains("proxy_pass http://10.0.0.2:3000"));

    let executed = connector.executed();
    assert!(executed.iter().any(|c| c.contains("certbot --nginx -d shop.example.com")));
    assert_eq!(executed.last().unwrap(), "sudo systemctl reload nginx");
}

#[tokio::test]
async fn test_install_agent_requires_active_service() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.reply("systemctl is-active", 3, "failed\n", "");
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(
            TaskRequest::new(TaskKind::InstallAgent)
                .on_host(host.id)
                .with_params(json!({ "port": 61300 })),
        )
        .await
        .unwrap();
    let task = wait_until_finished(&engine, task.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("glances service is not active"));
    assert!(
        connector.uploads()[0].1.contains("61300"),
        "unit file should carry the requested port"
    );
}

#[tokio::test]
async fn test_submit_rejects_missing_subjects() {
    let store = memory_store();
    let engine = engine_with(store.clone(), &ScriptedConnector::default());

    let err = engine
        .submit(TaskRequest::new(TaskKind::SshCheck))
        .await
        .unwrap_err();
    assert_matches!(err, TaskError::Invalid(_));

    let err = engine
        .submit(TaskRequest::new(TaskKind::SshCheck).on_host(99))
        .await
        .unwrap_err();
    assert_matches!(err, TaskError::Invalid(msg) if msg.contains("host 99"));

    let err = engine
        .submit(TaskRequest::new(TaskKind::DeployDomain).on_host(1))
        .await
        .unwrap_err();
    assert_matches!(err, TaskError::Invalid(_));

    assert_eq!(engine.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_cancel_stops_at_next_milestone() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    let gate = connector.hold_commands();
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(TaskRequest::new(TaskKind::DeployProxy).on_host(host.id))
        .await
        .unwrap();
    wait_for_status(&engine, task.id, TaskStatus::Running).await;
    while connector.executed().is_empty() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // Running tasks cannot be deleted
    let err = engine.delete(task.id).await.unwrap_err();
    assert_matches!(err, TaskError::InProgress(TaskStatus::Running));

    engine.cancel(task.id).await.unwrap();
    gate.notify_one();

    let task = wait_until_finished(&engine, task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(connector.executed(), vec!["sudo apt update"]);
    assert_eq!(connector.disconnects(), 1);

    let err = engine.cancel(task.id).await.unwrap_err();
    assert_matches!(err, TaskError::AlreadyFinished(TaskStatus::Failed));

    engine.delete(task.id).await.unwrap();
    assert_matches!(engine.get(task.id).await, Err(TaskError::NotFound(_)));
    assert!(store.task_logs(task.id, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_orphaned_tasks_are_failed() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();

    let pending = store
        .create_task(NewTask {
            name: "left behind".to_string(),
            kind: TaskKind::SshCheck,
            host_id: Some(host.id),
            domain_id: None,
            params: json!({}),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let running = store
        .create_task(NewTask {
            name: "interrupted".to_string(),
            kind: TaskKind::DeployProxy,
            host_id: Some(host.id),
            domain_id: None,
            params: json!({}),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store.start_task(running.id, Utc::now()).await.unwrap();

    let engine = engine_with(store.clone(), &ScriptedConnector::default());
    assert_eq!(engine.fail_orphaned().await.unwrap(), 2);

    for id in [pending.id, running.id] {
        let task = engine.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("task interrupted by hub restart")
        );
    }

    let failed = engine
        .list(&TaskFilter {
            status: Some(TaskStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 2);
    assert_eq!(engine.stats().await.unwrap().failed, 2);
}
