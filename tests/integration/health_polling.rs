//! Health poller against a mock metrics agent
//!
//! These tests verify that:
//! - Consecutive failures count up and reset on success
//! - Unreachable is entered exactly at max_failures with one ERROR alert
//! - Recovery produces one INFO alert
//! - Resource alerts fire once per excursion

use std::sync::Arc;
use std::time::Duration;

use fleetwarden::actors::{Alerting, HealthPoller, PollerHandle, PollerSettings};
use fleetwarden::config::Thresholds;
use fleetwarden::hysteresis::ThresholdEngine;
use fleetwarden::ledger::AlertLedger;
use fleetwarden::metrics::HttpMetricsClient;
use fleetwarden::model::{AlertFilter, AlertKind, AlertLevel, Reachability};
use fleetwarden::scheduler::Ticker;
use fleetwarden::storage::Store;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{host_on_mock, memory_store, snapshot_json};

fn poller(store: Arc<dyn Store>, max_failures: u32) -> HealthPoller {
    let ledger = AlertLedger::new(store.clone(), None);
    HealthPoller::new(
        store.clone(),
        Arc::new(HttpMetricsClient::new(Duration::from_secs(2)).unwrap()),
        Alerting::new(ThresholdEngine::new(store), ledger),
        PollerSettings {
            thresholds: Thresholds::default(),
            max_failures,
            concurrency: 4,
            timeout: Duration::from_secs(2),
        },
    )
}

#[tokio::test]
async fn test_unreachable_exactly_at_max_failures_then_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/4/all"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/4/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_json(20.0, 30.0, 40.0)))
        .mount(&server)
        .await;

    let store = memory_store();
    let host = store.create_host(host_on_mock("web-1", &server)).await.unwrap();
    let mut poller = poller(store.clone(), 3);

    for expected in 1..=2 {
        let summary = poller.run_cycle().await;
        assert_eq!(summary.failed, 1);

        let current = store.get_host(host.id).await.unwrap().unwrap();
        assert_eq!(current.consecutive_failures, expected);
        assert_ne!(current.reachability, Reachability::Unreachable);
    }
    assert!(store.list_alerts(&AlertFilter::default()).await.unwrap().is_empty());

    poller.run_cycle().await;
    let current = store.get_host(host.id).await.unwrap().unwrap();
    assert_eq!(current.reachability, Reachability::Unreachable);
    assert_eq!(current.consecutive_failures, 3);

    let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Error);
    assert_eq!(alerts[0].alert_kind, AlertKind::Unreachable);
    assert!(alerts[0].message.contains("3 consecutive checks"));

    let summary = poller.run_cycle().await;
    assert_eq!(summary.succeeded, 1);

    let current = store.get_host(host.id).await.unwrap().unwrap();
    assert_eq!(current.reachability, Reachability::Ok);
    assert_eq!(current.consecutive_failures, 0);

    let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].level, AlertLevel::Info);
    assert_eq!(alerts[0].alert_kind, AlertKind::Unreachable);
    assert_eq!(store.latest_samples(host.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cpu_excursion_alerts_once_each_way() {
    let server = MockServer::start().await;
    for cpu in [50.0, 90.0, 92.0, 80.0] {
        Mock::given(method("GET"))
            .and(path("/api/4/all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_json(cpu, 10.0, 10.0)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
    }

    let store = memory_store();
    store.create_host(host_on_mock("db-1", &server)).await.unwrap();
    let mut poller = poller(store.clone(), 3);

    let mut levels = Vec::new();
    for _ in 0..4 {
        let before = store.list_alerts(&AlertFilter::default()).await.unwrap().len();
        poller.run_cycle().await;
        let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
        levels.push((alerts.len() > before).then(|| alerts[0].level));
    }

    assert_eq!(
        levels,
        vec![None, Some(AlertLevel::Warning), None, Some(AlertLevel::Info)]
    );
}

#[tokio::test]
async fn test_poll_now_through_handle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(snapshot_json(1.0, 2.0, 3.0)))
        .mount(&server)
        .await;

    let store = memory_store();
    store.create_host(host_on_mock("a", &server)).await.unwrap();
    store.create_host(host_on_mock("b", &server)).await.unwrap();

    let handle = PollerHandle::spawn(
        poller(store.clone(), 3),
        Ticker::new(Duration::from_secs(3600), Duration::ZERO),
    );

    let summary = handle.poll_now().await.unwrap();
    assert_eq!(summary.polled, 2);
    assert_eq!(summary.succeeded, 2);

    handle.shutdown().await.unwrap();
}
