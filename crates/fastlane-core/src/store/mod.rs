//! System of record for Tasks, Jobs and Executions
//!
//! The Store is the single source of truth; queues are ephemeral hints.
//! Writes that race between workers go through compare-and-set: the losing
//! writer observes the newer state and becomes a no-op.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Execution, ExecutionStatus, Job, JobId, JobSpec, JobStatus, Task};
use crate::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Durable storage contract the engine consumes
#[async_trait]
pub trait Store: Send + Sync {
    /// Create or refresh schema objects
    async fn migrate(&self) -> Result<()>;

    /// Create the task if missing, touch it otherwise
    async fn upsert_task(&self, task_id: &str) -> Result<Task>;

    /// Read one task
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// List all tasks
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Persist a new job
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Read one job with its executions, ordered
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// List a task's jobs, newest first
    async fn list_jobs(&self, task_id: &str) -> Result<Vec<Job>>;

    /// Replace a job's spec
    async fn update_job_spec(&self, job_id: JobId, spec: &JobSpec) -> Result<()>;

    /// Persist the derived job status
    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()>;

    /// Count a suppressed cron fire
    async fn bump_skipped_triggers(&self, job_id: JobId) -> Result<()>;

    /// Extend the attempt bound after a manual /retry
    async fn bump_manual_retries(&self, job_id: JobId) -> Result<()>;

    /// Jobs whose trigger instant has passed, oldest trigger first
    async fn due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Compare-and-set the trigger instant; the write is the commit point
    /// for a fire. Returns false when another sweep won the race.
    async fn advance_trigger(
        &self,
        job_id: JobId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        new_status: Option<JobStatus>,
    ) -> Result<bool>;

    /// Put a recurring job back into the trigger index after a terminal
    /// execution
    async fn rearm_trigger(&self, job_id: JobId, next: DateTime<Utc>) -> Result<()>;

    /// Take a job out of the trigger index (stop, expiry)
    async fn clear_trigger(&self, job_id: JobId) -> Result<()>;

    /// Append an execution to a job (host decision recorded atomically
    /// with the record)
    async fn append_execution(&self, job_id: JobId, execution: &Execution) -> Result<()>;

    /// Compare-and-set an execution on `(execution_id, expected status)`.
    /// Writes every mutable field; returns false for the losing writer.
    async fn update_execution(
        &self,
        job_id: JobId,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool>;

    /// Executions occupying a host slot (non-terminal), grouped by host.
    ///
    /// Slots are held from record creation, not container start, so pool
    /// caps hold even while images are still pulling.
    async fn running_count_by_host(&self) -> Result<HashMap<String, usize>>;

    /// Every non-terminal execution, for the healer
    async fn non_terminal_executions(&self) -> Result<Vec<(JobId, Execution)>>;
}
