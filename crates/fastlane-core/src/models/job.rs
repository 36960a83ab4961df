//! Job: a single client submission that yields one or more Executions

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::models::{Execution, TaskId};

/// Unique job identifier (ULIDs are monotone)
pub type JobId = Ulid;

/// Notification targets carried on the job spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyTargets {
    /// Email addresses notified on terminal state
    #[serde(default)]
    pub emails: Vec<String>,

    /// Webhook URLs called on terminal state
    #[serde(default)]
    pub webhooks: Vec<String>,
}

impl NotifyTargets {
    /// Check if any target is configured
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.webhooks.is_empty()
    }
}

/// The execution request of a Job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Container image
    pub image: String,

    /// Command line run inside the container
    pub command: String,

    /// Environment passed to the container; values matching the configured
    /// blacklist are redacted in any externally-rendered form
    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    /// Opaque mapping passed through to webhooks
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Automatic retry budget (default 0)
    #[serde(default)]
    pub retries: u32,

    /// Absolute deadline after which the job may not start
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,

    /// Per-execution hard wall-clock limit, seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Terminal-state notification targets
    #[serde(default)]
    pub notify: NotifyTargets,
}

impl JobSpec {
    /// Create a minimal spec
    pub fn new(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: command.into(),
            envs: BTreeMap::new(),
            metadata: BTreeMap::new(),
            retries: 0,
            expiration: None,
            timeout: None,
            notify: NotifyTargets::default(),
        }
    }

    /// Set the retry budget
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the per-execution timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    /// Set the expiration deadline
    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(name.into(), value.into());
        self
    }

    /// Check whether the job is past its expiration deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|deadline| deadline < now).unwrap_or(false)
    }
}

/// When a Job's executions fire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Enqueue on submission
    Immediate,

    /// Enqueue once at a future instant
    At {
        /// Trigger instant
        when: DateTime<Utc>,
    },

    /// Re-enqueue on every cron fire (five-field expression, UTC)
    Cron {
        /// Cron expression
        expr: String,
    },
}

impl Schedule {
    /// Whether the schedule re-arms itself on terminal state
    pub fn is_recurring(&self) -> bool {
        matches!(self, Schedule::Cron { .. })
    }

    /// The cron expression, for recurring schedules
    pub fn cron_expr(&self) -> Option<&str> {
        match self {
            Schedule::Cron { expr } => Some(expr),
            _ => None,
        }
    }
}

/// Derived job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting on the jobs queue
    Enqueued,

    /// Waiting on a future trigger
    Scheduled,

    /// An execution is in flight
    Running,

    /// Latest execution exited 0 and no retry is pending
    Done,

    /// Retry budget exhausted
    Failed,

    /// Past the expiration deadline before it could start
    Expired,

    /// Operator stop
    Stopped,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Enqueued => write!(f, "enqueued"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Expired => write!(f, "expired"),
            JobStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl JobStatus {
    /// Check if the status is terminal (won't change without operator input)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Expired | JobStatus::Stopped
        )
    }

    /// Parse from the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueued" => Some(JobStatus::Enqueued),
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "expired" => Some(JobStatus::Expired),
            "stopped" => Some(JobStatus::Stopped),
            _ => None,
        }
    }
}

/// A single client submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID (monotone)
    pub job_id: JobId,

    /// Owning task
    pub task_id: TaskId,

    /// The execution request
    pub spec: JobSpec,

    /// Trigger definition
    pub schedule: Schedule,

    /// Earliest-visible trigger instant; None once taken (or for immediate)
    pub next_trigger_at: Option<DateTime<Utc>>,

    /// Ordered, append-only sequence of attempts
    #[serde(default)]
    pub executions: Vec<Execution>,

    /// Derived status, persisted for indexed lookups
    pub status: JobStatus,

    /// Cron fires suppressed because the previous execution was still running
    #[serde(default)]
    pub skipped_triggers: u32,

    /// Manual /retry invocations; each extends the attempt bound by one
    #[serde(default)]
    pub manual_retries: u32,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last modified timestamp
    pub last_modified_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job; immediate schedules start enqueued, the rest
    /// scheduled with their first trigger armed.
    pub fn new(task_id: impl Into<TaskId>, spec: JobSpec, schedule: Schedule) -> Self {
        let now = Utc::now();
        let (status, next_trigger_at) = match &schedule {
            Schedule::Immediate => (JobStatus::Enqueued, None),
            Schedule::At { when } => (JobStatus::Scheduled, Some(*when)),
            // the caller arms the first cron fire via with_next_trigger
            Schedule::Cron { .. } => (JobStatus::Scheduled, None),
        };
        Self {
            job_id: Ulid::new(),
            task_id: task_id.into(),
            spec,
            schedule,
            next_trigger_at,
            executions: Vec::new(),
            status,
            skipped_triggers: 0,
            manual_retries: 0,
            created_at: now,
            last_modified_at: now,
        }
    }

    /// Arm the first trigger (used for cron schedules at creation)
    pub fn with_next_trigger(mut self, next: DateTime<Utc>) -> Self {
        self.next_trigger_at = Some(next);
        self
    }

    /// The latest execution, if any
    pub fn latest_execution(&self) -> Option<&Execution> {
        self.executions.last()
    }

    /// The single in-flight execution, if any.
    ///
    /// The store's compare-and-set guarantees at most one exists.
    pub fn active_execution(&self) -> Option<&Execution> {
        self.executions.iter().rev().find(|e| !e.is_terminal())
    }

    /// Number of attempts so far
    pub fn executions_count(&self) -> usize {
        self.executions.len()
    }

    /// Attempt bound: `retries + 1`, extended by one per manual retry
    pub fn attempts_allowed(&self) -> usize {
        self.spec.retries as usize + 1 + self.manual_retries as usize
    }

    /// Whether a failed attempt still has automatic retry budget
    pub fn retry_budget_left(&self) -> bool {
        self.executions_count() < self.attempts_allowed()
    }

    /// Derive the job status from schedule state and the latest execution
    pub fn derived_status(&self) -> JobStatus {
        if matches!(self.status, JobStatus::Stopped | JobStatus::Expired) {
            return self.status;
        }
        if self.active_execution().is_some() {
            return JobStatus::Running;
        }
        match self.latest_execution() {
            Some(last) if last.status == crate::models::ExecutionStatus::Done => JobStatus::Done,
            Some(last) if last.status.is_retryable_failure() => {
                if self.retry_budget_left() || self.next_trigger_at.is_some() {
                    // a retry or the next cron fire is pending
                    self.status
                } else {
                    JobStatus::Failed
                }
            }
            Some(last) if last.status == crate::models::ExecutionStatus::Stopped => {
                JobStatus::Stopped
            }
            Some(last) if last.status == crate::models::ExecutionStatus::Expired => {
                JobStatus::Expired
            }
            _ => self.status,
        }
    }

    /// Canonical logs for the job: the latest execution's stdout/stderr
    pub fn logs(&self) -> (Option<&str>, Option<&str>) {
        match self.latest_execution() {
            Some(exec) => (Some(exec.stdout.as_str()), Some(exec.stderr.as_str())),
            None => (None, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Execution, ExecutionStatus};

    fn job_with(status: ExecutionStatus) -> Job {
        let mut job = Job::new("task", JobSpec::new("alpine", "echo hi"), Schedule::Immediate);
        let mut exec = Execution::new("host-a", "alpine", "echo hi", BTreeMap::new());
        exec.status = status;
        job.executions.push(exec);
        job
    }

    #[test]
    fn test_new_job_status() {
        let job = Job::new("t", JobSpec::new("alpine", "true"), Schedule::Immediate);
        assert_eq!(job.status, JobStatus::Enqueued);
        assert!(job.next_trigger_at.is_none());

        let when = Utc::now() + chrono::Duration::hours(1);
        let job = Job::new("t", JobSpec::new("alpine", "true"), Schedule::At { when });
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.next_trigger_at, Some(when));
    }

    #[test]
    fn test_attempt_bound() {
        let mut job = Job::new(
            "t",
            JobSpec::new("alpine", "true").with_retries(2),
            Schedule::Immediate,
        );
        assert_eq!(job.attempts_allowed(), 3);

        job.manual_retries = 2;
        assert_eq!(job.attempts_allowed(), 5);
    }

    #[test]
    fn test_active_execution() {
        let job = job_with(ExecutionStatus::Running);
        assert!(job.active_execution().is_some());

        let job = job_with(ExecutionStatus::Done);
        assert!(job.active_execution().is_none());
    }

    #[test]
    fn test_derived_status() {
        assert_eq!(job_with(ExecutionStatus::Running).derived_status(), JobStatus::Running);
        assert_eq!(job_with(ExecutionStatus::Pulling).derived_status(), JobStatus::Running);
        assert_eq!(job_with(ExecutionStatus::Done).derived_status(), JobStatus::Done);
        assert_eq!(job_with(ExecutionStatus::Failed).derived_status(), JobStatus::Failed);
        assert_eq!(job_with(ExecutionStatus::Stopped).derived_status(), JobStatus::Stopped);
    }

    #[test]
    fn test_failed_with_budget_is_not_terminal() {
        let mut job = Job::new(
            "t",
            JobSpec::new("alpine", "false").with_retries(1),
            Schedule::Immediate,
        );
        let mut exec = Execution::new("host-a", "alpine", "false", BTreeMap::new());
        exec.status = ExecutionStatus::Failed;
        job.executions.push(exec);

        // one attempt used out of two: still the persisted (non-terminal) status
        assert!(job.retry_budget_left());
        assert_eq!(job.derived_status(), JobStatus::Enqueued);
    }

    #[test]
    fn test_schedule_serde_tags() {
        let s = serde_json::to_value(Schedule::Immediate).unwrap();
        assert_eq!(s["kind"], "immediate");

        let s = serde_json::to_value(Schedule::Cron { expr: "* * * * *".into() }).unwrap();
        assert_eq!(s["kind"], "cron");
        assert_eq!(s["expr"], "* * * * *");
    }

    #[test]
    fn test_job_ids_monotone() {
        let a = Job::new("t", JobSpec::new("alpine", "true"), Schedule::Immediate);
        let b = Job::new("t", JobSpec::new("alpine", "true"), Schedule::Immediate);
        assert!(a.job_id <= b.job_id);
    }
}
