use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use fastlane_core::JobSubmission;

use crate::error::ApiResult;
use crate::routes::jobs::render_job;
use crate::state::AppState;

/// List all tasks
pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let tasks = state.service.list_tasks().await?;
    let rendered: Vec<serde_json::Value> = tasks
        .iter()
        .map(|t| {
            serde_json::json!({
                "task_id": t.task_id,
                "created_at": t.created_at,
                "last_modified_at": t.last_modified_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "tasks": rendered })))
}

/// Task detail with its jobs, newest first
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = state.service.get_task(&task_id).await?;
    let jobs = state.service.list_jobs(&task_id).await?;
    let blacklist = &state.ctx.config.env_blacklist;
    let rendered: Vec<serde_json::Value> = jobs.iter().map(|j| render_job(j, blacklist)).collect();

    Ok(Json(serde_json::json!({
        "task_id": task.task_id,
        "created_at": task.created_at,
        "last_modified_at": task.last_modified_at,
        "jobs": rendered,
    })))
}

/// Submit a job (immediate, delayed or cron); 201 on success, 400 on a
/// schema violation
pub async fn create_job(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let submission = parse_submission(body)?;
    let job = state.service.create_job(&task_id, submission).await?;
    let rendered = render_job(&job, &state.ctx.config.env_blacklist);
    Ok((StatusCode::CREATED, Json(rendered)))
}

/// Schema violations are 400s, like every other rejected submission
pub fn parse_submission(body: serde_json::Value) -> Result<JobSubmission, crate::error::ApiError> {
    serde_json::from_value(body)
        .map_err(|e| fastlane_core::Error::validation(format!("invalid submission: {}", e)).into())
}
