//! reqwest-backed [`MetricsClient`]

use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, trace};

use super::{MetricsClient, MetricsError};
use crate::model::MetricsAuth;

/// HTTP client for the metrics agent
///
/// One `reqwest::Client` is shared across all hosts and cycles.
#[derive(Debug, Clone)]
pub struct HttpMetricsClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMetricsClient {
    pub fn new(timeout: Duration) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Connection(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl MetricsClient for HttpMetricsClient {
    #[instrument(skip(self, auth))]
    async fn fetch(&self, url: &str, auth: &MetricsAuth) -> Result<serde_json::Value, MetricsError> {
        trace!("requesting snapshot");

        let mut request = self.client.get(url);
        request = match auth {
            MetricsAuth::None => request,
            MetricsAuth::Basic { username, password } => {
                request.basic_auth(username, password.as_deref())
            }
            MetricsAuth::Bearer { token } => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                MetricsError::Timeout(self.timeout.as_secs())
            } else {
                MetricsError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                MetricsError::Timeout(self.timeout.as_secs())
            } else {
                MetricsError::Connection(e.to_string())
            }
        })?;

        serde_json::from_str(&body).map_err(|e| MetricsError::Malformed(e.to_string()))
    }
}
