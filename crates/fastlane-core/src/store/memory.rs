//! In-memory store, mirroring the Postgres semantics for tests

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{Execution, ExecutionStatus, Job, JobId, JobSpec, JobStatus, Task};
use crate::store::Store;
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<String, Task>,
    jobs: BTreeMap<JobId, Job>,
}

/// Process-local store with the same compare-and-set behavior as the
/// Postgres backend
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_task(&self, task_id: &str) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .entry(task_id.to_string())
            .and_modify(|t| t.last_modified_at = Utc::now())
            .or_insert_with(|| Task::new(task_id));
        Ok(task.clone())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.inner.read().await.tasks.values().cloned().collect())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.job_id) {
            return Err(Error::conflict(format!("job {} already exists", job.job_id)));
        }
        inner.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, task_id: &str) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> =
            inner.jobs.values().filter(|j| j.task_id == task_id).cloned().collect();
        jobs.sort_by(|a, b| b.job_id.cmp(&a.job_id));
        Ok(jobs)
    }

    async fn update_job_spec(&self, job_id: JobId, spec: &JobSpec) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        job.spec = spec.clone();
        job.last_modified_at = Utc::now();
        Ok(())
    }

    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        job.status = status;
        job.last_modified_at = Utc::now();
        Ok(())
    }

    async fn bump_skipped_triggers(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.skipped_triggers += 1;
            job.last_modified_at = Utc::now();
        }
        Ok(())
    }

    async fn bump_manual_retries(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.manual_retries += 1;
            job.last_modified_at = Utc::now();
        }
        Ok(())
    }

    async fn due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .filter(|j| j.next_trigger_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_trigger_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_trigger(
        &self,
        job_id: JobId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        new_status: Option<JobStatus>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let job = match inner.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.next_trigger_at != Some(expected) {
            return Ok(false);
        }
        job.next_trigger_at = next;
        if let Some(status) = new_status {
            job.status = status;
        }
        job.last_modified_at = Utc::now();
        Ok(true)
    }

    async fn rearm_trigger(&self, job_id: JobId, next: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        job.next_trigger_at = Some(next);
        job.status = JobStatus::Scheduled;
        job.last_modified_at = Utc::now();
        Ok(())
    }

    async fn clear_trigger(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.next_trigger_at = None;
            job.last_modified_at = Utc::now();
        }
        Ok(())
    }

    async fn append_execution(&self, job_id: JobId, execution: &Execution) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::not_found(format!("job {}", job_id)))?;
        job.executions.push(execution.clone());
        job.last_modified_at = Utc::now();
        Ok(())
    }

    async fn update_execution(
        &self,
        job_id: JobId,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let job = match inner.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => return Ok(false),
        };
        let slot = job
            .executions
            .iter_mut()
            .find(|e| e.execution_id == execution.execution_id);
        match slot {
            Some(stored) if stored.status == expected => {
                *stored = execution.clone();
                job.last_modified_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn running_count_by_host(&self) -> Result<HashMap<String, usize>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            for execution in &job.executions {
                if !execution.is_terminal() {
                    if let Some(host) = &execution.container_host {
                        *counts.entry(host.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        Ok(counts)
    }

    async fn non_terminal_executions(&self) -> Result<Vec<(JobId, Execution)>> {
        let inner = self.inner.read().await;
        let mut found = Vec::new();
        for job in inner.jobs.values() {
            for execution in &job.executions {
                if !execution.is_terminal() {
                    found.push((job.job_id, execution.clone()));
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schedule;
    use std::collections::BTreeMap as Map;

    fn sample_job() -> Job {
        Job::new("task", JobSpec::new("alpine", "true"), Schedule::Immediate)
    }

    #[tokio::test]
    async fn test_task_upsert() {
        let store = MemoryStore::new();
        let first = store.upsert_task("etl").await.unwrap();
        let second = store.upsert_task("etl").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "task");
        assert!(store.insert_job(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_execution_cas() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let mut execution = Execution::new("host-a", "alpine", "true", Map::new());
        store.append_execution(job.job_id, &execution).await.unwrap();

        execution.status = ExecutionStatus::Created;
        assert!(store
            .update_execution(job.job_id, &execution, ExecutionStatus::Pulling)
            .await
            .unwrap());

        // losing writer: expected state already gone
        assert!(!store
            .update_execution(job.job_id, &execution, ExecutionStatus::Pulling)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_trigger_cas() {
        let store = MemoryStore::new();
        let when = Utc::now();
        let job = Job::new("t", JobSpec::new("alpine", "true"), Schedule::At { when });
        store.insert_job(&job).await.unwrap();

        let due = store.due_scheduled(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store
            .advance_trigger(job.job_id, when, None, Some(JobStatus::Enqueued))
            .await
            .unwrap());
        // second sweep loses the race
        assert!(!store
            .advance_trigger(job.job_id, when, None, Some(JobStatus::Enqueued))
            .await
            .unwrap());
        assert!(store.due_scheduled(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_counts_include_pulling() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.insert_job(&job).await.unwrap();

        let execution = Execution::new("host-a", "alpine", "true", Map::new());
        store.append_execution(job.job_id, &execution).await.unwrap();

        let counts = store.running_count_by_host().await.unwrap();
        assert_eq!(counts.get("host-a"), Some(&1));
    }
}
