//! Manual poll trigger

use axum::Json;
use axum::extract::State;

use crate::actors::PollSummary;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;

/// POST /api/v1/poll
///
/// Runs a cycle and returns its summary. Waits for a cycle already in flight.
pub async fn poll_now(State(state): State<ApiState>) -> ApiResult<Json<PollSummary>> {
    let poller = state
        .poller
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("health poller is not running".to_string()))?;

    Ok(Json(poller.poll_now().await?))
}
