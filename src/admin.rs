//! Admin HTTP surface: health, run-now and last-cycle status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::scheduler::PollScheduler;

/// Shared handler state.
#[derive(Clone)]
pub struct AdminState {
    pub scheduler: Arc<PollScheduler>,
}

/// Build the admin router.
pub fn routes(scheduler: Arc<PollScheduler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ingest/run", post(run_now))
        .route("/api/ingest/status", get(status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(AdminState { scheduler })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn run_now(State(state): State<AdminState>) -> impl IntoResponse {
    info!("Manual ingestion cycle requested");
    let report = state.scheduler.run_now().await;
    let code = if report.error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}
