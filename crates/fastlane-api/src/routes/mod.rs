pub mod jobs;
pub mod logs;
pub mod stream;
pub mod tasks;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router with all routes
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/:task_id", get(tasks::get_task).post(tasks::create_job))
        .route(
            "/tasks/:task_id/jobs/:job_id",
            get(jobs::get_job).put(jobs::update_job),
        )
        .route("/tasks/:task_id/jobs/:job_id/stop", post(jobs::stop_job))
        .route("/tasks/:task_id/jobs/:job_id/retry", post(jobs::retry_job))
        .route("/tasks/:task_id/jobs/:job_id/stdout", get(logs::stdout))
        .route("/tasks/:task_id/jobs/:job_id/stderr", get(logs::stderr))
        .route("/tasks/:task_id/jobs/:job_id/logs", get(logs::logs))
        .route("/tasks/:task_id/jobs/:job_id/stream", get(stream::sse_stream))
        .route("/tasks/:task_id/jobs/:job_id/ws", get(stream::ws_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Health and per-queue counters
async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": fastlane_core::VERSION,
        "metrics": state.ctx.metrics.snapshot(),
    }))
}
