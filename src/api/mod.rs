//! REST API for tasks, alerts and manual polling
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check including the store
//! - `POST /api/v1/tasks` - Submit a provisioning task
//! - `GET /api/v1/tasks` - List tasks (`status`, `kind`, `limit`)
//! - `GET /api/v1/tasks/stats` - Task counts per status
//! - `GET /api/v1/tasks/:id` - One task
//! - `DELETE /api/v1/tasks/:id` - Delete a finished task and its log
//! - `POST /api/v1/tasks/:id/cancel` - Request cancellation
//! - `GET /api/v1/tasks/:id/logs` - Stored log entries after `after`
//! - `GET /api/v1/tasks/:id/export` - Plain-text export
//! - `GET /api/v1/tasks/:id/stream` - Server-sent log stream from `after`
//! - `GET /api/v1/alerts` - List alerts (`unresolved`, `subject_id`, `limit`)
//! - `POST /api/v1/alerts/:id/resolve` - Resolve an alert
//! - `POST /api/v1/poll` - Run a health-poll cycle now

pub mod error;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiSettings;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,

    /// Enable CORS for browser clients
    pub enable_cors: bool,
}

impl From<&ApiSettings> for ApiConfig {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            bind_addr: settings.bind,
            enable_cors: settings.enable_cors,
        }
    }
}

pub fn router(state: ApiState, enable_cors: bool) -> Router {
    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/tasks",
            post(routes::tasks::submit_task).get(routes::tasks::list_tasks),
        )
        .route("/api/v1/tasks/stats", get(routes::tasks::task_stats))
        .route(
            "/api/v1/tasks/:id",
            get(routes::tasks::get_task).delete(routes::tasks::delete_task),
        )
        .route("/api/v1/tasks/:id/cancel", post(routes::tasks::cancel_task))
        .route("/api/v1/tasks/:id/logs", get(routes::tasks::task_logs))
        .route("/api/v1/tasks/:id/export", get(routes::tasks::export_task))
        .route("/api/v1/tasks/:id/stream", get(routes::tasks::stream_task))
        .route("/api/v1/alerts", get(routes::alerts::list_alerts))
        .route(
            "/api/v1/alerts/:id/resolve",
            post(routes::alerts::resolve_alert),
        )
        .route("/api/v1/poll", post(routes::poll::poll_now))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Spawn the API server
///
/// Binds, then serves in a background task. Returns the bound address, which
/// differs from the configured one when port 0 was requested.
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(state, config.enable_cors);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
