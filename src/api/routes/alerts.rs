//! Alert endpoints

use axum::Json;
use axum::extract::{Path, Query, State};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::model::{Alert, AlertFilter, AlertId};

/// GET /api/v1/alerts?unresolved=true&subject_id=..&limit=..
///
/// Newest first.
pub async fn list_alerts(
    State(state): State<ApiState>,
    Query(filter): Query<AlertFilter>,
) -> ApiResult<Json<Vec<Alert>>> {
    Ok(Json(state.store.list_alerts(&filter).await?))
}

/// POST /api/v1/alerts/:id/resolve
pub async fn resolve_alert(
    State(state): State<ApiState>,
    Path(id): Path<AlertId>,
) -> ApiResult<Json<Alert>> {
    state
        .ledger
        .resolve(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("alert {id} not found")))
}
