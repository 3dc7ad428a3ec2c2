//! Alert delivery through real notifiers against a mock endpoint

use std::sync::Arc;

use fleetwarden::hysteresis::{AlertEvent, Transition};
use fleetwarden::ledger::AlertLedger;
use fleetwarden::model::{AlertKey, AlertKind, AlertLevel};
use fleetwarden::notify::{Notifier, TelegramNotifier, WebhookNotifier};
use pretty_assertions::assert_eq;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::memory_store;

fn cpu_event(host_id: i64) -> AlertEvent {
    AlertEvent {
        key: AlertKey::host(host_id, AlertKind::CpuHigh),
        transition: Transition::Opened,
        level: AlertLevel::Warning,
        title: "High CPU usage on web-1".to_string(),
        message: "CPU usage at 91.0% (threshold 85%)".to_string(),
    }
}

#[tokio::test]
async fn test_telegram_delivery_marks_alert_notified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/botTOKEN/sendMessage"))
        .and(body_partial_json(serde_json::json!({
            "chat_id": "-100",
            "parse_mode": "Markdown",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let store = memory_store();
    let notifier = TelegramNotifier::new("TOKEN", "-100", Some(server.uri())).unwrap();
    let ledger = AlertLedger::new(store.clone(), Some(Arc::new(notifier) as Arc<dyn Notifier>));

    let alert = ledger.record(cpu_event(1)).await.unwrap();
    assert!(alert.notified_at.is_some());

    let stored = store.get_alert(alert.id).await.unwrap().unwrap();
    assert_eq!(stored.notified_at, alert.notified_at);
}

#[tokio::test]
async fn test_failed_webhook_delivery_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = memory_store();
    let notifier = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
    let ledger = AlertLedger::new(store.clone(), Some(Arc::new(notifier) as Arc<dyn Notifier>));

    let alert = ledger.record(cpu_event(7)).await.unwrap();
    assert_eq!(alert.notified_at, None);
    assert_eq!(store.undelivered_alerts(10).await.unwrap().len(), 1);

    let summary = ledger.retry_undelivered(10).await.unwrap();
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.delivered, 1);
    assert!(store.undelivered_alerts(10).await.unwrap().is_empty());

    let summary = ledger.retry_undelivered(10).await.unwrap();
    assert_eq!(summary.attempted, 0);
}
