use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fleetwarden::{
    actors::{
        Alerting, CheckerHandle, DomainChecker, HealthPoller, Maintenance, MaintenanceHandle,
        PollerHandle, PollerSettings,
    },
    api::{ApiConfig, ApiState, spawn_api_server},
    config::{Config, Inventory, NotifierConfig, read_config_file},
    dns::DigResolver,
    hysteresis::ThresholdEngine,
    ledger::AlertLedger,
    metrics::HttpMetricsClient,
    model::{HostId, NewDomain, default_ns_policy},
    notify::{Notifier, TelegramNotifier, WebhookNotifier},
    remote::OpenSshConnector,
    scheduler::Ticker,
    storage::{Store, open_store},
    stream::LogHub,
    tasks::{StepTimeouts, TaskEngine},
};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log at TRACE instead of DEBUG
    #[arg(long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("fleetwarden", level),
        ("fleetwarden_hub", level),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let mut config = read_config_file(&args.file)?;
    config.apply_env();
    config.validate().context("invalid configuration")?;

    let store = open_store(&config.storage)
        .await
        .context("failed to open store")?;
    seed_inventory(store.as_ref(), &config.inventory).await?;

    let notifier = build_notifier(&config.notifications.notifier)?;
    let ledger = AlertLedger::new(store.clone(), notifier);
    let alerting = Alerting::new(ThresholdEngine::new(store.clone()), ledger.clone());

    let poller = HealthPoller::new(
        store.clone(),
        Arc::new(HttpMetricsClient::new(secs(config.metrics.timeout_secs))?),
        alerting.clone(),
        PollerSettings {
            thresholds: config.thresholds,
            max_failures: config.poller.max_failures,
            concurrency: config.poller.concurrency,
            timeout: secs(config.metrics.timeout_secs),
        },
    );
    let poller = PollerHandle::spawn(
        poller,
        Ticker::new(
            secs(config.poller.interval_secs),
            secs(config.poller.jitter_secs),
        ),
    );

    let checker = DomainChecker::new(
        store.clone(),
        Arc::new(DigResolver::default()),
        alerting,
        config.dns.servers.clone(),
        secs(config.dns.timeout_secs),
    );
    let checker = CheckerHandle::spawn(
        checker,
        Ticker::new(secs(config.dns.interval_secs), secs(config.dns.jitter_secs)),
    );

    let maintenance = MaintenanceHandle::spawn(
        Maintenance::new(
            store.clone(),
            ledger.clone(),
            config.retention.clone(),
            config.notifications.retry_batch,
        ),
        Ticker::new(secs(config.retention.interval_secs), Duration::ZERO),
        Ticker::new(
            secs(config.notifications.retry_interval_secs),
            Duration::ZERO,
        ),
    );

    let tasks = TaskEngine::new(
        store.clone(),
        LogHub::new(store.clone()),
        Arc::new(OpenSshConnector::new(secs(config.ssh.connect_timeout_secs))),
        StepTimeouts {
            command: secs(config.ssh.command_timeout_secs),
            install: secs(config.ssh.install_timeout_secs),
        },
    );
    tasks.fail_orphaned().await?;

    let state = ApiState::new(store, tasks, ledger).with_poller(poller.clone());
    let addr = spawn_api_server(ApiConfig::from(&config.api), state).await?;
    info!("hub running, API on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    for (name, result) in [
        ("health poller", poller.shutdown().await),
        ("domain checker", checker.shutdown().await),
        ("maintenance", maintenance.shutdown().await),
    ] {
        if let Err(e) = result {
            error!("failed to stop {name}: {e:#}");
        }
    }

    Ok(())
}

fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn build_notifier(config: &NotifierConfig) -> anyhow::Result<Option<Arc<dyn Notifier>>> {
    let notifier: Arc<dyn Notifier> = match config {
        NotifierConfig::None => {
            warn!("no notifier configured, alerts are only stored");
            return Ok(None);
        }
        NotifierConfig::Telegram {
            bot_token,
            chat_id,
            api_base,
        } => Arc::new(TelegramNotifier::new(
            bot_token.clone(),
            chat_id.clone(),
            api_base.clone(),
        )?),
        NotifierConfig::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone())?),
    };
    Ok(Some(notifier))
}

/// Register configured hosts and domains that the store does not know yet
async fn seed_inventory(store: &dyn Store, inventory: &Inventory) -> anyhow::Result<()> {
    let mut hosts: HashMap<String, HostId> = store
        .list_hosts()
        .await?
        .into_iter()
        .map(|host| (host.name, host.id))
        .collect();

    for new_host in &inventory.hosts {
        if hosts.contains_key(&new_host.name) {
            continue;
        }
        let host = store.create_host(new_host.clone()).await?;
        info!("registered host {} ({})", host.name, host.address);
        hosts.insert(host.name, host.id);
    }

    let known_domains: Vec<String> = store
        .list_domains()
        .await?
        .into_iter()
        .map(|domain| domain.name)
        .collect();

    for domain in &inventory.domains {
        if known_domains.contains(&domain.name) {
            continue;
        }
        let new_domain = NewDomain {
            name: domain.name.clone(),
            host_id: domain.host.as_ref().and_then(|name| hosts.get(name).copied()),
            ns_policy: domain.ns_policy.clone().unwrap_or_else(default_ns_policy),
            ssl: domain.ssl,
            upstream: domain.upstream.clone(),
        };
        store.create_domain(new_domain).await?;
        info!("registered domain {}", domain.name);
    }

    Ok(())
}
