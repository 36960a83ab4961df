//! Postgres-backed store
//!
//! Jobs keep their spec and schedule as jsonb documents; executions live in
//! their own table so host occupancy and healer scans stay indexed.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use ulid::Ulid;

use crate::models::{Execution, ExecutionStatus, Job, JobId, JobSpec, JobStatus, Task};
use crate::store::Store;
use crate::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id          TEXT PRIMARY KEY,
    created_at       TIMESTAMPTZ NOT NULL,
    last_modified_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id           TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL REFERENCES tasks(task_id),
    spec             JSONB NOT NULL,
    schedule         JSONB NOT NULL,
    next_trigger_at  TIMESTAMPTZ,
    status           TEXT NOT NULL,
    skipped_triggers INTEGER NOT NULL DEFAULT 0,
    manual_retries   INTEGER NOT NULL DEFAULT 0,
    created_at       TIMESTAMPTZ NOT NULL,
    last_modified_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_task_idx
    ON jobs (task_id);
CREATE INDEX IF NOT EXISTS jobs_trigger_idx
    ON jobs (next_trigger_at) WHERE next_trigger_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS executions (
    execution_id   TEXT PRIMARY KEY,
    job_id         TEXT NOT NULL REFERENCES jobs(job_id),
    container_id   TEXT,
    container_host TEXT,
    image          TEXT NOT NULL,
    command        TEXT NOT NULL,
    envs           JSONB NOT NULL,
    status         TEXT NOT NULL,
    started_at     TIMESTAMPTZ,
    finished_at    TIMESTAMPTZ,
    exit_code      BIGINT,
    stdout         TEXT NOT NULL DEFAULT '',
    stderr         TEXT NOT NULL DEFAULT '',
    error          TEXT,
    poll_count     INTEGER NOT NULL DEFAULT 0,
    created_at     TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS executions_job_idx
    ON executions (job_id);
CREATE INDEX IF NOT EXISTS executions_host_active_idx
    ON executions (container_host)
    WHERE status IN ('pulling', 'created', 'running');
"#;

const TERMINAL_STATUSES: &str = "('done', 'failed', 'timedout', 'stopped', 'expired')";

/// Store backed by a Postgres pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool to the configured database
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn executions_for(&self, job_id: &str) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE job_id = $1 ORDER BY execution_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn job_from_row(&self, row: &PgRow) -> Result<Job> {
        let job_id: String = row.try_get("job_id")?;
        let executions = self.executions_for(&job_id).await?;

        let spec: serde_json::Value = row.try_get("spec")?;
        let schedule: serde_json::Value = row.try_get("schedule")?;
        let status: String = row.try_get("status")?;

        Ok(Job {
            job_id: parse_ulid(&job_id)?,
            task_id: row.try_get("task_id")?,
            spec: serde_json::from_value(spec)?,
            schedule: serde_json::from_value(schedule)?,
            next_trigger_at: row.try_get("next_trigger_at")?,
            executions,
            status: JobStatus::parse(&status)
                .ok_or_else(|| Error::Other(format!("unknown job status '{}'", status)))?,
            skipped_triggers: row.try_get::<i32, _>("skipped_triggers")? as u32,
            manual_retries: row.try_get::<i32, _>("manual_retries")? as u32,
            created_at: row.try_get("created_at")?,
            last_modified_at: row.try_get("last_modified_at")?,
        })
    }
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).map_err(|e| Error::Other(format!("invalid ulid '{}': {}", raw, e)))
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    let execution_id: String = row.try_get("execution_id")?;
    let envs: serde_json::Value = row.try_get("envs")?;
    let status: String = row.try_get("status")?;

    Ok(Execution {
        execution_id: parse_ulid(&execution_id)?,
        container_id: row.try_get("container_id")?,
        container_host: row.try_get("container_host")?,
        image: row.try_get("image")?,
        command: row.try_get("command")?,
        envs: serde_json::from_value(envs)?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| Error::Other(format!("unknown execution status '{}'", status)))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        exit_code: row.try_get("exit_code")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        error: row.try_get("error")?,
        poll_count: row.try_get::<i32, _>("poll_count")? as u32,
        created_at: row.try_get("created_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    Ok(Task {
        task_id: row.try_get("task_id")?,
        created_at: row.try_get("created_at")?,
        last_modified_at: row.try_get("last_modified_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_task(&self, task_id: &str) -> Result<Task> {
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, created_at, last_modified_at)
            VALUES ($1, NOW(), NOW())
            ON CONFLICT (task_id) DO UPDATE SET last_modified_at = NOW()
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        task_from_row(&row)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY task_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, task_id, spec, schedule, next_trigger_at, status,
                skipped_triggers, manual_retries, created_at, last_modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.task_id)
        .bind(serde_json::to_value(&job.spec)?)
        .bind(serde_json::to_value(&job.schedule)?)
        .bind(job.next_trigger_at)
        .bind(job.status.to_string())
        .bind(job.skipped_triggers as i32)
        .bind(job.manual_retries as i32)
        .bind(job.created_at)
        .bind(job.last_modified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.job_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, task_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE task_id = $1 ORDER BY job_id DESC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(self.job_from_row(row).await?);
        }
        Ok(jobs)
    }

    async fn update_job_spec(&self, job_id: JobId, spec: &JobSpec) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET spec = $2, last_modified_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id.to_string())
        .bind(serde_json::to_value(spec)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn set_job_status(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = $2, last_modified_at = NOW() WHERE job_id = $1")
            .bind(job_id.to_string())
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_skipped_triggers(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET skipped_triggers = skipped_triggers + 1, last_modified_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_manual_retries(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET manual_retries = manual_retries + 1, last_modified_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_scheduled(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE next_trigger_at IS NOT NULL
              AND next_trigger_at <= $1
              AND status NOT IN ('done', 'failed', 'stopped', 'expired')
            ORDER BY next_trigger_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            jobs.push(self.job_from_row(row).await?);
        }
        Ok(jobs)
    }

    async fn advance_trigger(
        &self,
        job_id: JobId,
        expected: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
        new_status: Option<JobStatus>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET next_trigger_at = $3,
                status = COALESCE($4, status),
                last_modified_at = NOW()
            WHERE job_id = $1 AND next_trigger_at = $2
            "#,
        )
        .bind(job_id.to_string())
        .bind(expected)
        .bind(next)
        .bind(new_status.map(|s| s.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn rearm_trigger(&self, job_id: JobId, next: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET next_trigger_at = $2, status = 'scheduled', last_modified_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.to_string())
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_trigger(&self, job_id: JobId) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET next_trigger_at = NULL, last_modified_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_execution(&self, job_id: JobId, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                execution_id, job_id, container_id, container_host, image, command,
                envs, status, started_at, finished_at, exit_code, stdout, stderr,
                error, poll_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(job_id.to_string())
        .bind(&execution.container_id)
        .bind(&execution.container_host)
        .bind(&execution.image)
        .bind(&execution.command)
        .bind(serde_json::to_value(&execution.envs)?)
        .bind(execution.status.to_string())
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.exit_code)
        .bind(&execution.stdout)
        .bind(&execution.stderr)
        .bind(&execution.error)
        .bind(execution.poll_count as i32)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE jobs SET last_modified_at = NOW() WHERE job_id = $1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn update_execution(
        &self,
        job_id: JobId,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET container_id = $4, status = $5, started_at = $6, finished_at = $7,
                exit_code = $8, stdout = $9, stderr = $10, error = $11, poll_count = $12
            WHERE execution_id = $1 AND job_id = $2 AND status = $3
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(job_id.to_string())
        .bind(expected.to_string())
        .bind(&execution.container_id)
        .bind(execution.status.to_string())
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.exit_code)
        .bind(&execution.stdout)
        .bind(&execution.stderr)
        .bind(&execution.error)
        .bind(execution.poll_count as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn running_count_by_host(&self) -> Result<HashMap<String, usize>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT container_host, COUNT(*) AS occupied
            FROM executions
            WHERE container_host IS NOT NULL AND status NOT IN {}
            GROUP BY container_host
            "#,
            TERMINAL_STATUSES
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let host: String = row.try_get("container_host")?;
            let occupied: i64 = row.try_get("occupied")?;
            counts.insert(host, occupied as usize);
        }
        Ok(counts)
    }

    async fn non_terminal_executions(&self) -> Result<Vec<(JobId, Execution)>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM executions WHERE status NOT IN {} ORDER BY execution_id",
            TERMINAL_STATUSES
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let job_id: String = row.try_get("job_id")?;
            found.push((parse_ulid(&job_id)?, execution_from_row(row)?));
        }
        Ok(found)
    }
}
