use axum::extract::{Path, State};
use axum::Json;

use crate::error::ApiResult;
use crate::routes::jobs::parse_job_id;
use crate::state::AppState;

/// Last execution's stdout, as plain text
pub async fn stdout(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<String> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.get_job(&task_id, job_id).await?;
    let (stdout, _) = job.logs();
    Ok(stdout.unwrap_or_default().to_string())
}

/// Last execution's stderr, as plain text
pub async fn stderr(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<String> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.get_job(&task_id, job_id).await?;
    let (_, stderr) = job.logs();
    Ok(stderr.unwrap_or_default().to_string())
}

/// Both streams of the last execution
pub async fn logs(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.get_job(&task_id, job_id).await?;
    let (stdout, stderr) = job.logs();
    Ok(Json(serde_json::json!({
        "stdout": stdout.unwrap_or_default(),
        "stderr": stderr.unwrap_or_default(),
    })))
}
