//! Runner: materialize an Execution on a host
//!
//! Pull, create, start; each step is a store transition point, so a crash
//! between any two leaves a record the healer can resume. The persisted
//! `container_id` is the witness that lets the monitor take over.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::context::Context;
use crate::models::{Execution, ExecutionStatus, Job, JobId};
use crate::monitor::finalize_attempt;
use crate::queue::{push_message, MonitorMessage};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::Store;
use crate::{Error, Result};

/// Launches and resumes execution attempts
pub struct Runner {
    ctx: Arc<Context>,
}

impl Runner {
    /// Create a runner over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Create a fresh execution on the chosen host and drive it to running.
    ///
    /// The host decision is recorded atomically with the execution record
    /// (step 1), before any runtime call.
    pub async fn launch(&self, job: &Job, host: &str) -> Result<()> {
        let execution =
            Execution::new(host, &job.spec.image, &job.spec.command, job.spec.envs.clone());
        self.ctx.store.append_execution(job.job_id, &execution).await?;
        self.ctx.store.set_job_status(job.job_id, crate::models::JobStatus::Running).await?;
        info!(
            job_id = %job.job_id,
            execution_id = %execution.execution_id,
            host = %host,
            attempt = job.executions_count() + 1,
            "execution dispatched"
        );
        self.drive(job.job_id, execution).await
    }

    /// Continue a partially-materialized execution (healer or requeue path)
    pub async fn resume(&self, job_id: JobId, execution: Execution) -> Result<()> {
        self.drive(job_id, execution).await
    }

    /// Walk the remaining steps: pull -> create -> start -> monitor enqueue
    async fn drive(&self, job_id: JobId, mut execution: Execution) -> Result<()> {
        let host = execution
            .container_host
            .clone()
            .ok_or_else(|| Error::Other("execution without a host".to_string()))?;
        let runtime = self.ctx.runtime(&host)?;

        if execution.status == ExecutionStatus::Pulling && execution.container_id.is_none() {
            if let Err(e) = runtime.pull(&execution.image).await {
                return self.runtime_failure(job_id, &execution, &host, e, "pull").await;
            }

            let container_id =
                match runtime.create(&execution.image, &execution.command, &execution.envs).await {
                    Ok(id) => id,
                    Err(e) => {
                        return self.runtime_failure(job_id, &execution, &host, e, "create").await
                    }
                };

            let mut created = execution.clone();
            created.container_id = Some(container_id);
            created.status = ExecutionStatus::Created;
            if !self
                .ctx
                .store
                .update_execution(job_id, &created, ExecutionStatus::Pulling)
                .await?
            {
                // another worker owns this attempt now
                return Ok(());
            }
            execution = created;
        }

        if execution.status == ExecutionStatus::Created {
            let container_id = execution
                .container_id
                .clone()
                .ok_or_else(|| Error::Other("created execution without container".to_string()))?;
            if let Err(e) = runtime.start(&container_id).await {
                return self.runtime_failure(job_id, &execution, &host, e, "start").await;
            }

            let mut running = execution.clone();
            running.status = ExecutionStatus::Running;
            running.started_at = Some(Utc::now());
            if !self
                .ctx
                .store
                .update_execution(job_id, &running, ExecutionStatus::Created)
                .await?
            {
                return Ok(());
            }
            execution = running;
            self.ctx.health.record_success(&host);
        }

        if execution.status == ExecutionStatus::Running {
            let delay = Duration::from_secs(self.ctx.config.monitor.initial_delay_secs);
            push_message(
                self.ctx.queues.monitor.as_ref(),
                &MonitorMessage { job_id, execution_id: execution.execution_id },
                delay,
            )
            .await?;
        }
        Ok(())
    }

    /// Classify a runtime failure: transient infra bubbles up for requeue,
    /// permanent faults consume this attempt.
    async fn runtime_failure(
        &self,
        job_id: JobId,
        execution: &Execution,
        host: &str,
        error: RuntimeError,
        step: &str,
    ) -> Result<()> {
        if error.is_transient() {
            self.ctx.health.record_failure(host, &self.ctx.config.breaker, Utc::now());
            return Err(error.into());
        }

        warn!(
            job_id = %job_id,
            execution_id = %execution.execution_id,
            step = step,
            "attempt failed permanently: {}",
            error
        );
        let mut failed = execution.clone();
        failed.status = ExecutionStatus::Failed;
        failed.finished_at = Some(Utc::now());
        failed.error = Some(format!("{} failed: {}", step, error));

        let won = self.ctx.store.update_execution(job_id, &failed, execution.status).await?;
        if won {
            finalize_attempt(&self.ctx, job_id, execution.execution_id, ExecutionStatus::Failed, Utc::now())
                .await?;
        }
        Ok(())
    }
}
