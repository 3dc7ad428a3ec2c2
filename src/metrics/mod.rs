//! Metrics agent client
//!
//! Hosts run a metrics agent that serves a JSON health snapshot over HTTP. The
//! poller talks to it through the [`MetricsClient`] trait so tests can swap in a
//! mock server or a scripted client.

pub mod http;
pub mod snapshot;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::MetricsAuth;

pub use http::HttpMetricsClient;
pub use snapshot::HealthSnapshot;

/// Failure to obtain a usable snapshot. All variants count as a failed poll.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("agent returned HTTP {0}")]
    Status(u16),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Fetches the raw health snapshot from a host's metrics agent
#[async_trait]
pub trait MetricsClient: Send + Sync {
    async fn fetch(&self, url: &str, auth: &MetricsAuth) -> Result<serde_json::Value, MetricsError>;
}
