//! Job operations behind the API surface
//!
//! Validation happens here, before anything is stored: a bad cron
//! expression, malformed envs or a conflicting schedule never reach the
//! store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::context::Context;
use crate::models::{
    ExecutionStatus, Job, JobId, JobSpec, JobStatus, NotifyTargets, Schedule, Task,
};
use crate::queue::{push_message, JobMessage, MonitorMessage};
use crate::runtime::ContainerRuntime;
use crate::scheduler::next_cron_fire;
use crate::store::Store;
use crate::worker::emit_terminal_events;
use crate::{Error, Result};

/// Parse a duration like `45`, `45s`, `10m`, `2h` or `1d` (bare numbers
/// are seconds)
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation("empty duration"));
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let suffix = raw.chars().last().unwrap_or_default();
    let number = &raw[..raw.len() - suffix.len_utf8()];
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid duration '{}'", raw)))?;
    let secs = match suffix {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        'd' => value * 86_400,
        _ => return Err(Error::validation(format!("invalid duration '{}'", raw))),
    };
    Ok(Duration::from_secs(secs))
}

/// The submission body of `POST /tasks/{task_id}/`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobSubmission {
    /// Container image
    pub image: String,

    /// Command line
    pub command: String,

    /// Environment mapping
    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    /// Opaque mapping passed to webhooks
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Automatic retry budget
    #[serde(default)]
    pub retries: u32,

    /// Per-execution wall-clock limit, seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Absolute deadline after which the job may not start
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,

    /// Run once at this instant
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,

    /// Run once after this delay (`300`, `5m`, `2h`, ...)
    #[serde(default)]
    pub start_in: Option<String>,

    /// Recur on this five-field cron expression (UTC)
    #[serde(default)]
    pub cron: Option<String>,

    /// Terminal-state notification targets
    #[serde(default)]
    pub notify: NotifyTargets,
}

impl JobSubmission {
    /// Validate and split into spec plus schedule. Rejected submissions are
    /// never stored.
    pub fn into_parts(self, now: DateTime<Utc>) -> Result<(JobSpec, Schedule)> {
        if self.image.trim().is_empty() {
            return Err(Error::validation("image must not be empty"));
        }
        if self.command.trim().is_empty() {
            return Err(Error::validation("command must not be empty"));
        }
        for name in self.envs.keys() {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(Error::validation(format!("invalid env name '{}'", name)));
            }
        }
        for address in &self.notify.webhooks {
            Url::parse(address)
                .map_err(|e| Error::validation(format!("invalid webhook '{}': {}", address, e)))?;
        }
        if let Some(deadline) = self.expiration {
            if deadline <= now {
                return Err(Error::validation("expiration is already in the past"));
            }
        }

        let selectors =
            [self.start_at.is_some(), self.start_in.is_some(), self.cron.is_some()]
                .iter()
                .filter(|&&chosen| chosen)
                .count();
        if selectors > 1 {
            return Err(Error::validation(
                "startAt, startIn and cron are mutually exclusive",
            ));
        }

        let schedule = if let Some(expr) = self.cron {
            // parse now so a bad expression 400s instead of being stored
            next_cron_fire(&expr, now)?;
            Schedule::Cron { expr }
        } else if let Some(when) = self.start_at {
            Schedule::At { when }
        } else if let Some(delay) = self.start_in {
            let delay = parse_duration(&delay)?;
            let when = now
                + chrono::Duration::from_std(delay)
                    .map_err(|_| Error::validation("startIn is too large"))?;
            Schedule::At { when }
        } else {
            Schedule::Immediate
        };

        let spec = JobSpec {
            image: self.image,
            command: self.command,
            envs: self.envs,
            metadata: self.metadata,
            retries: self.retries,
            expiration: self.expiration,
            timeout: self.timeout,
            notify: self.notify,
        };
        Ok((spec, schedule))
    }
}

/// Core job operations (`create`, `update`, `stop`, `retry`, reads)
pub struct JobService {
    ctx: Arc<Context>,
}

impl JobService {
    /// Create a service over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Create a job under a task; immediate submissions are enqueued at
    /// once, the rest wait in the trigger index.
    pub async fn create_job(&self, task_id: &str, submission: JobSubmission) -> Result<Job> {
        Task::validate_id(task_id)?;
        let now = Utc::now();
        let (spec, schedule) = submission.into_parts(now)?;

        self.ctx.store.upsert_task(task_id).await?;

        let job = match &schedule {
            Schedule::Cron { expr } => {
                let first = next_cron_fire(expr, now)?;
                Job::new(task_id, spec, schedule.clone()).with_next_trigger(first)
            }
            _ => Job::new(task_id, spec, schedule.clone()),
        };
        self.ctx.store.insert_job(&job).await?;

        if matches!(schedule, Schedule::Immediate) {
            push_message(
                self.ctx.queues.jobs.as_ref(),
                &JobMessage::new(job.job_id),
                Duration::ZERO,
            )
            .await?;
        }

        info!(task_id = %task_id, job_id = %job.job_id, status = %job.status, "job created");
        Ok(job)
    }

    /// Replace a job's spec. Terminal jobs conflict.
    pub async fn update_job(
        &self,
        task_id: &str,
        job_id: JobId,
        submission: JobSubmission,
    ) -> Result<Job> {
        let job = self.owned_job(task_id, job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::conflict(format!("job {} is {}", job_id, job.status)));
        }

        let (spec, _) = submission.into_parts(Utc::now())?;
        self.ctx.store.update_job_spec(job_id, &spec).await?;
        self.owned_job(task_id, job_id).await
    }

    /// Read one task
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.ctx
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("task {}", task_id)))
    }

    /// List all tasks
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.ctx.store.list_tasks().await
    }

    /// List a task's jobs, newest first
    pub async fn list_jobs(&self, task_id: &str) -> Result<Vec<Job>> {
        self.get_task(task_id).await?;
        self.ctx.store.list_jobs(task_id).await
    }

    /// Read one job, scoped to its task
    pub async fn get_job(&self, task_id: &str, job_id: JobId) -> Result<Job> {
        self.owned_job(task_id, job_id).await
    }

    /// Cooperative stop: flip statuses, ask the runtime to stop, let the
    /// monitor finalize logs on its next tick.
    pub async fn stop_job(&self, task_id: &str, job_id: JobId) -> Result<Job> {
        let job = self.owned_job(task_id, job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::conflict(format!("job {} is already {}", job_id, job.status)));
        }

        self.ctx.store.clear_trigger(job_id).await?;
        self.ctx.store.set_job_status(job_id, JobStatus::Stopped).await?;

        match job.active_execution() {
            Some(active) => {
                let mut stopped = active.clone();
                stopped.status = ExecutionStatus::Stopped;
                self.ctx.store.update_execution(job_id, &stopped, active.status).await?;

                if let (Some(container_id), Some(host)) =
                    (&active.container_id, &active.container_host)
                {
                    if let Ok(runtime) = self.ctx.runtime(host) {
                        if let Err(e) = runtime.stop(container_id).await {
                            tracing::warn!(container_id = %container_id, "stop request failed: {}", e);
                        }
                    }
                }
                push_message(
                    self.ctx.queues.monitor.as_ref(),
                    &MonitorMessage { job_id, execution_id: active.execution_id },
                    Duration::ZERO,
                )
                .await?;
            }
            None => {
                emit_terminal_events(&self.ctx, job_id, JobStatus::Stopped, None).await?;
            }
        }

        info!(task_id = %task_id, job_id = %job_id, "job stopped");
        self.owned_job(task_id, job_id).await
    }

    /// Force a fresh attempt of a terminal job; extends the attempt bound
    /// by one.
    pub async fn retry_job(&self, task_id: &str, job_id: JobId) -> Result<Job> {
        let job = self.owned_job(task_id, job_id).await?;
        if !job.status.is_terminal() {
            return Err(Error::conflict(format!("job {} is still {}", job_id, job.status)));
        }
        if job.status == JobStatus::Expired {
            return Err(Error::conflict(format!("job {} is past its expiration", job_id)));
        }

        self.ctx.store.bump_manual_retries(job_id).await?;
        self.ctx.store.set_job_status(job_id, JobStatus::Enqueued).await?;
        push_message(self.ctx.queues.jobs.as_ref(), &JobMessage::new(job_id), Duration::ZERO)
            .await?;

        info!(task_id = %task_id, job_id = %job_id, "manual retry enqueued");
        self.owned_job(task_id, job_id).await
    }

    async fn owned_job(&self, task_id: &str, job_id: JobId) -> Result<Job> {
        let job = self
            .ctx
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        if job.task_id != task_id {
            return Err(Error::not_found(format!("job {} under task {}", job_id, task_id)));
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> JobSubmission {
        JobSubmission {
            image: "alpine".to_string(),
            command: "echo hi".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_submission_immediate() {
        let (spec, schedule) = submission().into_parts(Utc::now()).unwrap();
        assert_eq!(spec.image, "alpine");
        assert_eq!(schedule, Schedule::Immediate);
    }

    #[test]
    fn test_submission_rejects_empty_image() {
        let mut body = submission();
        body.image = "  ".to_string();
        assert!(body.into_parts(Utc::now()).is_err());
    }

    #[test]
    fn test_submission_rejects_bad_cron() {
        let mut body = submission();
        body.cron = Some("not a cron".to_string());
        let err = body.into_parts(Utc::now()).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_submission_rejects_bad_envs() {
        let mut body = submission();
        body.envs.insert("BAD=NAME".to_string(), "x".to_string());
        assert!(body.into_parts(Utc::now()).is_err());
    }

    #[test]
    fn test_submission_rejects_bad_webhook() {
        let mut body = submission();
        body.notify.webhooks.push("not a url".to_string());
        assert!(body.into_parts(Utc::now()).is_err());
    }

    #[test]
    fn test_submission_selectors_exclusive() {
        let mut body = submission();
        body.cron = Some("* * * * *".to_string());
        body.start_in = Some("5m".to_string());
        assert!(body.into_parts(Utc::now()).is_err());
    }

    #[test]
    fn test_submission_rejects_past_expiration() {
        let mut body = submission();
        body.expiration = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(body.into_parts(Utc::now()).is_err());
    }

    #[test]
    fn test_submission_start_in() {
        let now = Utc::now();
        let mut body = submission();
        body.start_in = Some("10m".to_string());
        let (_, schedule) = body.into_parts(now).unwrap();
        match schedule {
            Schedule::At { when } => assert_eq!(when, now + chrono::Duration::minutes(10)),
            other => panic!("expected at schedule, got {:?}", other),
        }
    }

    #[test]
    fn test_submission_schema_rejects_unknown_fields() {
        let raw = r#"{"image": "alpine", "command": "true", "priority": "high"}"#;
        assert!(serde_json::from_str::<JobSubmission>(raw).is_err());
    }

    #[test]
    fn test_submission_wire_names() {
        let raw = r#"{
            "image": "alpine",
            "command": "true",
            "startAt": "2030-01-01T00:00:00Z"
        }"#;
        let body: JobSubmission = serde_json::from_str(raw).unwrap();
        assert!(body.start_at.is_some());
    }
}
