//! Task endpoints

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::api::types::{LogQuery, SubmittedResponse};
use crate::model::{Task, TaskFilter, TaskId, TaskLogEntry, TaskStats};
use crate::tasks::TaskRequest;

/// POST /api/v1/tasks
///
/// Returns 202 with the new task's id. The task runs in the background.
pub async fn submit_task(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<SubmittedResponse>)> {
    let task = state.tasks.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmittedResponse { id: task.id })))
}

/// GET /api/v1/tasks?status=Running&kind=ssh_check&limit=..
pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.tasks.list(&filter).await?))
}

/// GET /api/v1/tasks/stats
pub async fn task_stats(State(state): State<ApiState>) -> ApiResult<Json<TaskStats>> {
    Ok(Json(state.tasks.stats().await?))
}

/// GET /api/v1/tasks/:id
pub async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.get(id).await?))
}

/// DELETE /api/v1/tasks/:id
///
/// 409 while the task is pending or running.
pub async fn delete_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> ApiResult<StatusCode> {
    state.tasks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.tasks.cancel(id).await?))
}

/// GET /api/v1/tasks/:id/logs?after=..
pub async fn task_logs(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<TaskLogEntry>>> {
    Ok(Json(state.tasks.logs(id, query.after).await?))
}

/// GET /api/v1/tasks/:id/export
pub async fn export_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> ApiResult<impl IntoResponse> {
    let text = state.tasks.export(id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    ))
}

/// GET /api/v1/tasks/:id/stream?after=..
///
/// One JSON document per server-sent event. The stream closes after the
/// task's terminal status event.
pub async fn stream_task(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let events = state
        .tasks
        .hub()
        .subscribe(id, query.after)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    let events = events.map(|event| Event::default().json_data(event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
