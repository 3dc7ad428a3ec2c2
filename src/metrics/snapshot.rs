//! Typed view of the agent's health snapshot
//!
//! The agent payload looks like:
//!
//! ```json
//! {
//!   "cpu": { "total": 12.5 },
//!   "mem": { "percent": 41.0, "total": 8000000000, "available": 4720000000 },
//!   "fs": [ { "mnt_point": "/", "percent": 63.2 }, { "mnt_point": "/data", "percent": 88.0 } ],
//!   "load": { "min1": 0.4, "min5": 0.3, "min15": 0.2 },
//!   "uptime": "3 days, 4:05:06"
//! }
//! ```
//!
//! Every section is optional. A section with an unexpected shape is treated as
//! absent rather than zero, and only a payload that is not a JSON object at all
//! is rejected as malformed.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::MetricsError;
use crate::model::{AlertKind, HostId, MetricSample};

#[derive(Debug, Deserialize)]
struct CpuSection {
    total: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MemSection {
    percent: Option<f64>,
    total: Option<f64>,
    available: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FsEntry {
    percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LoadSection {
    min1: Option<f64>,
    min5: Option<f64>,
    min15: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Uptime {
    Seconds(f64),
    Text(String),
}

/// Parsed readings from one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    /// Highest usage across all reported filesystems
    pub disk_pct: Option<f64>,
    pub load1: Option<f64>,
    pub load5: Option<f64>,
    pub load15: Option<f64>,
    pub uptime_secs: Option<u64>,
}

fn section<T: DeserializeOwned>(payload: &Map<String, Value>, key: &str) -> Option<T> {
    payload
        .get(key)
        .and_then(|value| T::deserialize(value).ok())
}

impl HealthSnapshot {
    pub fn from_payload(payload: &Value) -> Result<Self, MetricsError> {
        let Value::Object(payload) = payload else {
            return Err(MetricsError::Malformed(format!(
                "expected a JSON object, got {}",
                json_type(payload)
            )));
        };

        let cpu_pct = section::<CpuSection>(payload, "cpu").and_then(|cpu| cpu.total);

        let mem_pct = section::<MemSection>(payload, "mem").and_then(|mem| {
            mem.percent.or(match (mem.total, mem.available) {
                (Some(total), Some(available)) if total > 0.0 => {
                    Some((total - available) / total * 100.0)
                }
                _ => None,
            })
        });

        let disk_pct = payload
            .get("fs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|entry| FsEntry::deserialize(entry).ok())
            .filter_map(|entry| entry.percent)
            .reduce(f64::max);

        let load = section::<LoadSection>(payload, "load");

        let uptime_secs = section::<Uptime>(payload, "uptime").and_then(|uptime| match uptime {
            Uptime::Seconds(secs) if secs >= 0.0 => Some(secs as u64),
            Uptime::Seconds(_) => None,
            Uptime::Text(text) => parse_uptime(&text),
        });

        Ok(Self {
            cpu_pct,
            mem_pct,
            disk_pct,
            load1: load.as_ref().and_then(|l| l.min1),
            load5: load.as_ref().and_then(|l| l.min5),
            load15: load.as_ref().and_then(|l| l.min15),
            uptime_secs,
        })
    }

    /// Reading that feeds the given resource alert, if this snapshot has it
    pub fn value_for(&self, kind: AlertKind) -> Option<f64> {
        match kind {
            AlertKind::CpuHigh => self.cpu_pct,
            AlertKind::MemHigh => self.mem_pct,
            AlertKind::DiskHigh => self.disk_pct,
            AlertKind::Unreachable | AlertKind::NsFailed => None,
        }
    }

    pub fn into_sample(self, host_id: HostId, raw: Value, taken_at: DateTime<Utc>) -> MetricSample {
        MetricSample {
            host_id,
            cpu_pct: self.cpu_pct,
            mem_pct: self.mem_pct,
            disk_pct: self.disk_pct,
            load1: self.load1,
            load5: self.load5,
            load15: self.load15,
            uptime_secs: self.uptime_secs,
            raw_payload: raw,
            taken_at,
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse uptime strings like `"4:05:06"` or `"3 days, 4:05:06"`
fn parse_uptime(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(secs) = text.parse::<u64>() {
        return Some(secs);
    }

    let (days, clock) = match text.split_once(',') {
        Some((days, clock)) => {
            let days = days.split_whitespace().next()?.parse::<u64>().ok()?;
            (days, clock.trim())
        }
        None => (0, text),
    };

    let mut parts = clock.split(':').map(|p| p.trim().parse::<u64>());
    let (h, m, s) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    if parts.next().is_some() {
        return None;
    }

    Some(days * 86_400 + h * 3_600 + m * 60 + s)
}
