//! Request and response bodies that are not plain model types

use serde::{Deserialize, Serialize};

use crate::model::{LogId, TaskId};
use crate::storage::HealthStatus;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub storage: HealthStatus,
}

/// Returned by `POST /api/v1/tasks`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmittedResponse {
    pub id: TaskId,
}

/// Log cursor shared by the logs and stream endpoints
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LogQuery {
    /// Only entries with a greater id are returned
    #[serde(default)]
    pub after: LogId,
}
