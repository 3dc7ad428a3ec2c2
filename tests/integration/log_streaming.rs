//! Task log streaming while a job runs

use std::time::Duration;

use fleetwarden::model::{TaskKind, TaskStatus};
use fleetwarden::stream::StreamEvent;
use fleetwarden::tasks::TaskRequest;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use crate::helpers::{ScriptedConnector, engine_with, memory_store, new_host, wait_until_finished};

#[tokio::test]
async fn test_live_stream_ends_with_failed_status() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    connector.reply("echo", 255, "", "Host key verification failed.");
    let gate = connector.hold_commands();
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(TaskRequest::new(TaskKind::SshCheck).on_host(host.id))
        .await
        .unwrap();
    while connector.executed().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stream = engine.hub().subscribe(task.id, 0).await.unwrap().unwrap();
    gate.notify_one();

    let events: Vec<StreamEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream should end once the task is terminal");

    let last = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(last["type"], "status");
    assert_eq!(last["status"], "Failed");
    assert!(
        last["error_message"]
            .as_str()
            .unwrap()
            .contains("Host key verification failed.")
    );

    let streamed: Vec<i64> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Log(log) => Some(log.id),
            StreamEvent::Status(_) => None,
        })
        .collect();
    let stored: Vec<i64> = engine
        .logs(task.id, 0)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.id)
        .collect();
    assert_eq!(streamed, stored);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Status(status) => Some(status.progress),
            StreamEvent::Log(_) => None,
        })
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test]
async fn test_reconnect_with_cursor_replays_the_rest() {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let connector = ScriptedConnector::default();
    let engine = engine_with(store.clone(), &connector);

    let task = engine
        .submit(TaskRequest::new(TaskKind::SshCheck).on_host(host.id))
        .await
        .unwrap();
    let task = wait_until_finished(&engine, task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let logs = engine.logs(task.id, 0).await.unwrap();
    assert!(logs.len() > 2);
    let cursor = logs[1].id;

    let events: Vec<StreamEvent> = engine
        .hub()
        .subscribe(task.id, cursor)
        .await
        .unwrap()
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), logs.len() - 2 + 1);
    assert!(matches!(&events[0], StreamEvent::Log(log) if log.id == logs[2].id));
    assert!(events.last().unwrap().is_terminal());

    assert!(engine.hub().subscribe(9_999, 0).await.unwrap().is_none());
}
