use axum::extract::{Path, State};
use axum::Json;
use ulid::Ulid;

use fastlane_core::models::redact_envs;
use fastlane_core::{Job, JobId};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Parse a job id out of the path; garbage is a 400, not a 404
pub fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    Ulid::from_string(raw)
        .map_err(|_| fastlane_core::Error::validation(format!("invalid job id '{}'", raw)).into())
}

/// Render a job for the outside world: blacklisted env values are hidden
pub fn render_job(job: &Job, blacklist: &[String]) -> serde_json::Value {
    let executions: Vec<serde_json::Value> = job
        .executions
        .iter()
        .map(|e| {
            serde_json::json!({
                "execution_id": e.execution_id.to_string(),
                "container_id": e.container_id,
                "container_host": e.container_host,
                "image": e.image,
                "command": e.command,
                "envs": redact_envs(&e.envs, blacklist),
                "status": e.status,
                "started_at": e.started_at,
                "finished_at": e.finished_at,
                "exit_code": e.exit_code,
                "error": e.error,
            })
        })
        .collect();

    serde_json::json!({
        "job_id": job.job_id.to_string(),
        "task_id": job.task_id,
        "status": job.status,
        "schedule": job.schedule,
        "next_trigger_at": job.next_trigger_at,
        "skipped_triggers": job.skipped_triggers,
        "manual_retries": job.manual_retries,
        "spec": {
            "image": job.spec.image,
            "command": job.spec.command,
            "envs": redact_envs(&job.spec.envs, blacklist),
            "metadata": job.spec.metadata,
            "retries": job.spec.retries,
            "expiration": job.spec.expiration,
            "timeout": job.spec.timeout,
            "notify": job.spec.notify,
        },
        "executions": executions,
        "created_at": job.created_at,
        "last_modified_at": job.last_modified_at,
    })
}

/// Job detail
pub async fn get_job(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.get_job(&task_id, job_id).await?;
    Ok(Json(render_job(&job, &state.ctx.config.env_blacklist)))
}

/// Replace a job's spec
pub async fn update_job(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let submission = crate::routes::tasks::parse_submission(body)?;
    let job = state.service.update_job(&task_id, job_id, submission).await?;
    Ok(Json(render_job(&job, &state.ctx.config.env_blacklist)))
}

/// Cooperative stop; 409 once the job is terminal
pub async fn stop_job(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.stop_job(&task_id, job_id).await?;
    Ok(Json(render_job(&job, &state.ctx.config.env_blacklist)))
}

/// Force a fresh attempt of a terminal job
pub async fn retry_job(
    State(state): State<AppState>,
    Path((task_id, job_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state.service.retry_job(&task_id, job_id).await?;
    Ok(Json(render_job(&job, &state.ctx.config.env_blacklist)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastlane_core::{JobSpec, Schedule};

    #[test]
    fn test_render_redacts_envs() {
        let spec = JobSpec::new("alpine", "true")
            .with_env("PATH", "/usr/bin")
            .with_env("API_TOKEN", "hunter2");
        let job = Job::new("t", spec, Schedule::Immediate);

        let rendered = render_job(&job, &["TOKEN".to_string()]);
        assert_eq!(rendered["spec"]["envs"]["PATH"], "/usr/bin");
        assert_eq!(rendered["spec"]["envs"]["API_TOKEN"], "***");
    }

    #[test]
    fn test_parse_job_id() {
        assert!(parse_job_id(&Ulid::new().to_string()).is_ok());
        assert!(parse_job_id("nope").is_err());
    }
}
