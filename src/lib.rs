//! Fleet health poller, alerting state machine and remote provisioning engine
//!
//! The hub binary wires these together:
//!
//! - [`actors::HealthPoller`] fetches host snapshots and drives [`hysteresis`]
//! - [`actors::DomainChecker`] verifies nameserver delegation
//! - [`ledger::AlertLedger`] stores alerts and hands them to a [`notify::Notifier`]
//! - [`tasks::TaskEngine`] runs provisioning jobs over [`remote`] sessions
//! - [`stream::LogHub`] replays and tails task logs

pub mod actors;
pub mod config;
pub mod dns;
pub mod hysteresis;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod stream;
pub mod tasks;

#[cfg(feature = "api")]
pub mod api;
