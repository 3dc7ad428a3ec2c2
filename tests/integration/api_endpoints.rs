//! Integration tests for API endpoints
//!
//! These tests verify that:
//! - Tasks can be submitted, listed, exported, streamed and deleted over HTTP
//! - Lifecycle violations map to 409 and unknown ids to 404
//! - Alerts can be listed and resolved
//! - Manual polling reports 503 when no poller runs

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetwarden::api::{ApiConfig, ApiState, spawn_api_server};
use fleetwarden::hysteresis::{AlertEvent, Transition};
use fleetwarden::ledger::AlertLedger;
use fleetwarden::model::{AlertKey, AlertLevel, Host, TaskStatus};
use fleetwarden::storage::Store;
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};

use crate::helpers::{ScriptedConnector, engine_with, memory_store, new_host};

struct TestApi {
    addr: SocketAddr,
    store: Arc<dyn Store>,
    ledger: AlertLedger,
    host: Host,
    client: reqwest::Client,
}

impl TestApi {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn wait_finished(&self, id: i64) -> Value {
        for _ in 0..200 {
            let task: Value = self
                .client
                .get(self.url(&format!("/api/v1/tasks/{id}")))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if task["status"] == "Completed" || task["status"] == "Failed" {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }
}

async fn spawn_test_api(connector: ScriptedConnector) -> TestApi {
    let store = memory_store();
    let host = store.create_host(new_host("web-1")).await.unwrap();
    let ledger = AlertLedger::new(store.clone(), None);
    let state = ApiState::new(store.clone(), engine_with(store.clone(), &connector), ledger.clone());

    let config = ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(), // Random port
        enable_cors: true,
    };
    let addr = spawn_api_server(config, state).await.unwrap();

    TestApi {
        addr,
        store,
        ledger,
        host,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let api = spawn_test_api(ScriptedConnector::default()).await;

    let response = api.client.get(api.url("/api/v1/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"]["healthy"], true);
}

#[tokio::test]
async fn test_task_lifecycle_over_http() {
    let connector = ScriptedConnector::default();
    connector.reply("echo", 0, "SSH test successful\n", "");
    let api = spawn_test_api(connector).await;

    let response = api
        .client
        .post(api.url("/api/v1/tasks"))
        .json(&json!({ "kind": "ssh_check", "host_id": api.host.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let id = response.json::<Value>().await.unwrap()["id"].as_i64().unwrap();

    let task = api.wait_finished(id).await;
    assert_eq!(task["status"], "Completed");
    assert_eq!(task["progress"], 100);

    let listed: Vec<Value> = api
        .client
        .get(api.url("/api/v1/tasks?status=Completed&kind=ssh_check"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let stats: Value = api
        .client
        .get(api.url("/api/v1/tasks/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["completed"], 1);
    assert_eq!(stats["total"], 1);

    let logs: Vec<Value> = api
        .client
        .get(api.url(&format!("/api/v1/tasks/{id}/logs?after=1")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs.iter().all(|entry| entry["id"].as_i64().unwrap() > 1));

    let response = api
        .client
        .get(api.url(&format!("/api/v1/tasks/{id}/export")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let export = response.text().await.unwrap();
    assert!(export.contains("SSH check on web-1"));

    let stream = api
        .client
        .get(api.url(&format!("/api/v1/tasks/{id}/stream")))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let last_event = stream
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .last()
        .unwrap();
    let last_event: Value = serde_json::from_str(last_event).unwrap();
    assert_eq!(last_event["type"], "status");
    assert_eq!(last_event["status"], "Completed");

    let response = api
        .client
        .post(api.url(&format!("/api/v1/tasks/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = api
        .client
        .delete(api.url(&format!("/api/v1/tasks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = api
        .client
        .get(api.url(&format!("/api/v1/tasks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], format!("task {id} not found"));
}

#[tokio::test]
async fn test_running_task_cannot_be_deleted() {
    let connector = ScriptedConnector::default();
    let gate = connector.hold_commands();
    let api = spawn_test_api(connector.clone()).await;

    let id = api
        .client
        .post(api.url("/api/v1/tasks"))
        .json(&json!({ "kind": "deploy_proxy", "host_id": api.host.id }))
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()["id"]
        .as_i64()
        .unwrap();

    while connector.executed().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = api
        .client
        .delete(api.url(&format!("/api/v1/tasks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let cancelled: Value = api
        .client
        .post(api.url(&format!("/api/v1/tasks/{id}/cancel")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancelled["id"], id);
    gate.notify_one();

    let task = api.wait_finished(id).await;
    assert_eq!(task["status"], "Failed");
    assert_eq!(task["error_message"], "task cancelled");
    assert_eq!(
        api.store.get_task(id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let api = spawn_test_api(ScriptedConnector::default()).await;

    let response = api
        .client
        .post(api.url("/api/v1/tasks"))
        .json(&json!({ "kind": "ssh_check", "host_id": 4242 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .client
        .get(api.url("/api/v1/tasks/4242/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_alerts_list_and_resolve() {
    let api = spawn_test_api(ScriptedConnector::default()).await;
    let alert = api
        .ledger
        .record(AlertEvent {
            key: AlertKey::domain(3),
            transition: Transition::Opened,
            level: AlertLevel::Warning,
            title: "NS check failed for example.com".to_string(),
            message: "None of the nameservers contain 'dnspod'".to_string(),
        })
        .await
        .unwrap();

    let open: Vec<Value> = api
        .client
        .get(api.url("/api/v1/alerts?unresolved=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["alert_kind"], "ns_failed");

    let resolved: Value = api
        .client
        .post(api.url(&format!("/api/v1/alerts/{}/resolve", alert.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["is_resolved"], true);

    let open: Vec<Value> = api
        .client
        .get(api.url("/api/v1/alerts?unresolved=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(open.is_empty());

    let response = api
        .client
        .post(api.url("/api/v1/alerts/999/resolve"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_poll_without_poller_is_unavailable() {
    let api = spawn_test_api(ScriptedConnector::default()).await;

    let response = api.client.post(api.url("/api/v1/poll")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
