//! Nameserver resolution and NS policy evaluation

pub mod dig;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use dig::DigResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Ns,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Ns => "NS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Domain does not exist")]
    NxDomain,

    #[error("No NS records found")]
    NoAnswer,

    #[error("DNS query timeout")]
    Timeout,

    #[error("DNS resolution error: {0}")]
    Other(String),
}

/// Resolves record sets against an explicit list of upstream servers
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(
        &self,
        name: &str,
        record_type: RecordType,
        servers: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, ResolveError>;
}

/// Outcome of checking one domain against its NS policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsVerdict {
    pub nameservers: Vec<String>,
    pub is_valid: bool,
    pub error: Option<String>,
}

/// Decide NS compliance from a resolution result
///
/// A domain complies when any nameserver contains `policy`, compared
/// case-insensitively. Resolution errors are non-compliant and carry their text.
pub fn evaluate_ns_policy(resolved: Result<Vec<String>, ResolveError>, policy: &str) -> NsVerdict {
    let records = match resolved {
        Ok(records) => records,
        Err(e) => {
            return NsVerdict {
                nameservers: Vec::new(),
                is_valid: false,
                error: Some(e.to_string()),
            };
        }
    };

    let nameservers: Vec<String> = records
        .iter()
        .map(|ns| ns.trim().trim_end_matches('.').to_string())
        .filter(|ns| !ns.is_empty())
        .collect();

    if nameservers.is_empty() {
        return NsVerdict {
            nameservers,
            is_valid: false,
            error: Some("No nameservers found".to_string()),
        };
    }

    let needle = policy.to_lowercase();
    let is_valid = nameservers
        .iter()
        .any(|ns| ns.to_lowercase().contains(&needle));

    NsVerdict {
        error: (!is_valid).then(|| format!("None of the nameservers contain '{policy}'")),
        nameservers,
        is_valid,
    }
}
