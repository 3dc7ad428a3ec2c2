//! NS policy checks against a scripted resolver

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use fleetwarden::actors::{Alerting, CheckerHandle, DomainChecker};
use fleetwarden::dns::ResolveError;
use fleetwarden::hysteresis::ThresholdEngine;
use fleetwarden::ledger::AlertLedger;
use fleetwarden::model::{AlertFilter, AlertKind, AlertLevel, NewDomain, SubjectKind};
use fleetwarden::scheduler::Ticker;
use fleetwarden::storage::Store;
use pretty_assertions::assert_eq;

use crate::helpers::{ScriptedResolver, memory_store};

fn domain(name: &str) -> NewDomain {
    NewDomain {
        name: name.to_string(),
        host_id: None,
        ns_policy: "dnspod".to_string(),
        ssl: false,
        upstream: None,
    }
}

fn checker(store: Arc<dyn Store>, resolver: Arc<ScriptedResolver>) -> DomainChecker {
    let ledger = AlertLedger::new(store.clone(), None);
    DomainChecker::new(
        store.clone(),
        resolver,
        Alerting::new(ThresholdEngine::new(store), ledger),
        vec!["8.8.8.8".to_string()],
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn test_policy_violation_opens_ns_failed_once() {
    let store = memory_store();
    let resolver = Arc::new(ScriptedResolver::default());
    resolver.answer(
        "example.com",
        Ok(vec!["ns1.cloudflare.com.", "ns2.cloudflare.com."]),
    );
    let example = store.create_domain(domain("example.com")).await.unwrap();

    let checker = checker(store.clone(), resolver.clone());
    for _ in 0..3 {
        let summary = checker.run_cycle().await;
        assert_eq!(summary.invalid, 1);
    }

    let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_kind, AlertKind::NsFailed);
    assert_eq!(alerts[0].subject_kind, SubjectKind::Domain);
    assert_eq!(alerts[0].level, AlertLevel::Warning);
    assert_eq!(alerts[0].message, "None of the nameservers contain 'dnspod'");

    let checks = store.ns_checks(example.id, 10).await.unwrap();
    assert_eq!(checks.len(), 3);
    assert!(!checks[0].is_valid);
    assert_eq!(checks[0].nameservers, vec!["ns1.cloudflare.com", "ns2.cloudflare.com"]);

    let stamped = store.get_domain(example.id).await.unwrap().unwrap();
    assert!(stamped.last_checked_at.is_some());

    resolver.answer("example.com", Ok(vec!["f1g1ns1.DNSPOD.net."]));
    let summary = checker.run_cycle().await;
    assert_eq!(summary.valid, 1);

    let alerts = store.list_alerts(&AlertFilter::default()).await.unwrap();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[0].level, AlertLevel::Info);
    assert_eq!(alerts[0].message, "Nameservers: f1g1ns1.DNSPOD.net");
}

#[tokio::test]
async fn test_resolution_errors_are_recorded_per_domain() {
    let store = memory_store();
    let resolver = Arc::new(ScriptedResolver::default());
    resolver.answer("good.com", Ok(vec!["a.dnspod.net."]));
    resolver.answer("slow.com", Err(ResolveError::Timeout));
    store.create_domain(domain("good.com")).await.unwrap();
    let slow = store.create_domain(domain("slow.com")).await.unwrap();
    // missing.com has no answer and resolves to NXDOMAIN
    store.create_domain(domain("missing.com")).await.unwrap();

    let handle = CheckerHandle::spawn(
        checker(store.clone(), resolver),
        Ticker::new(Duration::from_secs(3600), Duration::ZERO),
    );
    let summary = handle.check_now().await.unwrap();
    handle.shutdown().await.unwrap();

    assert_eq!(summary.checked, 3);
    assert_eq!(summary.valid, 1);
    assert_eq!(summary.invalid, 2);

    let checks = store.ns_checks(slow.id, 1).await.unwrap();
    assert_matches!(checks[0].error.as_deref(), Some("DNS query timeout"));

    let open = store
        .list_alerts(&AlertFilter {
            unresolved: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
}
