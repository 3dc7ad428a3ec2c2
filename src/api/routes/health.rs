//! Health check endpoint

use axum::Json;
use axum::extract::State;

use crate::api::error::ApiResult;
use crate::api::state::ApiState;
use crate::api::types::HealthResponse;

/// GET /api/v1/health
pub async fn health_check(State(state): State<ApiState>) -> ApiResult<Json<HealthResponse>> {
    let storage = state.store.health_check().await?;

    Ok(Json(HealthResponse {
        status: if storage.healthy { "ok" } else { "degraded" },
        timestamp: chrono::Utc::now().to_rfc3339(),
        storage,
    }))
}
