//! [`NameResolver`] backed by the system `dig` binary

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

use super::{NameResolver, RecordType, ResolveError};

/// Runs one `dig` query per upstream server until one answers
#[derive(Debug, Clone)]
pub struct DigResolver {
    program: String,
}

impl Default for DigResolver {
    fn default() -> Self {
        Self {
            program: "dig".to_string(),
        }
    }
}

impl DigResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn query(
        &self,
        name: &str,
        record_type: RecordType,
        server: &str,
        timeout: Duration,
    ) -> Result<Vec<String>, ResolveError> {
        let secs = timeout.as_secs().max(1);
        let output = Command::new(&self.program)
            .arg(format!("@{server}"))
            .arg(name)
            .arg(record_type.as_str())
            .arg(format!("+time={secs}"))
            .arg("+tries=1")
            .arg("+noall")
            .arg("+comments")
            .arg("+answer")
            .kill_on_drop(true)
            .output();

        // dig enforces its own timeout; the outer one guards against a stuck process
        let output = tokio::time::timeout(timeout + Duration::from_secs(1), output)
            .await
            .map_err(|_| ResolveError::Timeout)?
            .map_err(|e| ResolveError::Other(format!("failed to run {}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("dig output: {stdout}");

        // exit status 9 means no reply from the server
        if output.status.code() == Some(9) || stdout.contains("connection timed out") {
            return Err(ResolveError::Timeout);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResolveError::Other(stderr.trim().to_string()));
        }

        parse_dig_output(&stdout, record_type)
    }
}

#[async_trait]
impl NameResolver for DigResolver {
    #[instrument(skip(self, servers, timeout))]
    async fn resolve(
        &self,
        name: &str,
        record_type: RecordType,
        servers: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, ResolveError> {
        let mut last_error = ResolveError::Other("no DNS servers configured".to_string());

        for server in servers {
            match self.query(name, record_type, server, timeout).await {
                Err(ResolveError::Timeout) => {
                    debug!("server {server} timed out, trying next");
                    last_error = ResolveError::Timeout;
                }
                Err(ResolveError::Other(msg)) => {
                    debug!("server {server} failed: {msg}");
                    last_error = ResolveError::Other(msg);
                }
                authoritative => return authoritative,
            }
        }

        Err(last_error)
    }
}

/// Extract the answer section of `dig +noall +comments +answer` output
pub fn parse_dig_output(output: &str, record_type: RecordType) -> Result<Vec<String>, ResolveError> {
    let status = output
        .lines()
        .find_map(|line| line.split_once("status: "))
        .map(|(_, rest)| rest.split(',').next().unwrap_or(rest).trim().to_string());

    match status.as_deref() {
        Some("NOERROR") | None => {}
        Some("NXDOMAIN") => return Err(ResolveError::NxDomain),
        Some(other) => return Err(ResolveError::Other(other.to_string())),
    }

    let records: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, _, _, kind, value, ..] if kind.eq_ignore_ascii_case(record_type.as_str()) => {
                    Some(value.to_string())
                }
                _ => None,
            }
        })
        .collect();

    if records.is_empty() {
        return Err(ResolveError::NoAnswer);
    }
    Ok(records)
}
