//! Execution monitor: observe, time out, finalize, decide retry vs final
//!
//! Every store write here is a compare-and-set keyed on the execution's
//! current status, so a duplicate monitor message (or a racing worker)
//! observes the newer state and becomes a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::models::{
    execution::tail_bytes, Execution, ExecutionId, ExecutionStatus, JobId, JobStatus,
};
use crate::queue::{push_message, JobMessage};
use crate::scheduler::next_cron_fire;
use crate::runtime::{ContainerRuntime, ContainerState, RuntimeError};
use crate::store::Store;
use crate::worker::emit_terminal_events;
use crate::Result;

/// What a monitor step decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Still running; look again after the delay
    Repoll(Duration),

    /// The execution reached this terminal status
    Finalized(ExecutionStatus),

    /// Stale message; the store already holds a newer state
    NoOp,
}

/// Drives executions to a terminal state
pub struct Monitor {
    ctx: Arc<Context>,
}

impl Monitor {
    /// Create a monitor over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// One poll cycle for an execution
    pub async fn step(
        &self,
        job_id: JobId,
        execution_id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<MonitorOutcome> {
        let job = match self.ctx.store.get_job(job_id).await? {
            Some(job) => job,
            None => return Ok(MonitorOutcome::NoOp),
        };
        let execution = match job.executions.iter().find(|e| e.execution_id == execution_id) {
            Some(execution) => execution.clone(),
            None => return Ok(MonitorOutcome::NoOp),
        };

        if execution.is_terminal() {
            // a stop leaves log capture to the next tick
            if execution.status == ExecutionStatus::Stopped && execution.finished_at.is_none() {
                self.finalize_stopped(job_id, &execution, now).await?;
                return Ok(MonitorOutcome::Finalized(ExecutionStatus::Stopped));
            }
            return Ok(MonitorOutcome::NoOp);
        }

        let container_id = match execution.container_id.clone() {
            Some(id) => id,
            None => {
                // the runner died before create; the attempt is unrecoverable
                self.fail_attempt(job_id, &execution, "container was never created", now).await?;
                return Ok(MonitorOutcome::Finalized(ExecutionStatus::Failed));
            }
        };

        let host = execution.container_host.clone().unwrap_or_default();
        let runtime = self.ctx.runtime(&host)?;

        let info = match runtime.inspect(&container_id).await {
            Ok(info) => info,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(RuntimeError::NotFound(_)) => {
                self.fail_attempt(job_id, &execution, "container missing", now).await?;
                return Ok(MonitorOutcome::Finalized(ExecutionStatus::Failed));
            }
            Err(e) => {
                self.fail_attempt(job_id, &execution, &e.to_string(), now).await?;
                return Ok(MonitorOutcome::Finalized(ExecutionStatus::Failed));
            }
        };

        match info.state {
            ContainerState::Created => {
                // start never landed; take over from the crashed runner
                runtime.start(&container_id).await.map_err(crate::Error::from)?;
                let mut started = execution.clone();
                started.status = ExecutionStatus::Running;
                started.started_at = Some(now);
                self.ctx.store.update_execution(job_id, &started, execution.status).await?;
                Ok(MonitorOutcome::Repoll(Duration::from_secs(
                    self.ctx.config.monitor.initial_delay_secs,
                )))
            }
            ContainerState::Running => {
                if execution.status != ExecutionStatus::Running {
                    let mut started = execution.clone();
                    started.status = ExecutionStatus::Running;
                    started.started_at = execution.started_at.or(Some(now));
                    self.ctx.store.update_execution(job_id, &started, execution.status).await?;
                    return Ok(MonitorOutcome::Repoll(Duration::from_secs(
                        self.ctx.config.monitor.initial_delay_secs,
                    )));
                }

                let timeout = job.spec.timeout.map(Duration::from_secs);
                let elapsed = execution
                    .started_at
                    .map(|s| (now - s).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                if let Some(timeout) = timeout {
                    if elapsed >= timeout.as_secs() {
                        return self
                            .time_out(job_id, &execution, &container_id, elapsed, now)
                            .await;
                    }
                }

                let mut polled = execution.clone();
                polled.poll_count += 1;
                self.ctx
                    .store
                    .update_execution(job_id, &polled, ExecutionStatus::Running)
                    .await?;
                Ok(MonitorOutcome::Repoll(self.ctx.config.monitor.poll.delay(execution.poll_count)))
            }
            ContainerState::Exited => {
                let logs = self.capture_logs(&host, &container_id).await?;
                let exit_code = info.exit_code.unwrap_or(-1);
                let status = if exit_code == 0 {
                    ExecutionStatus::Done
                } else {
                    ExecutionStatus::Failed
                };

                let mut finished = execution.clone();
                finished.status = status;
                finished.exit_code = Some(exit_code);
                finished.finished_at = Some(now);
                finished.stdout = logs.0;
                finished.stderr = logs.1;
                if status == ExecutionStatus::Failed {
                    finished.error = Some(format!("exited with code {}", exit_code));
                }

                let won =
                    self.ctx.store.update_execution(job_id, &finished, execution.status).await?;
                if won {
                    self.mark_processed(&host, &container_id, &finished).await;
                    finalize_attempt(&self.ctx, job_id, execution_id, status, now).await?;
                    info!(
                        job_id = %job_id,
                        execution_id = %execution_id,
                        exit_code = exit_code,
                        status = %status,
                        "execution finished"
                    );
                }
                Ok(MonitorOutcome::Finalized(status))
            }
            ContainerState::Gone => {
                self.fail_attempt(job_id, &execution, "container gone", now).await?;
                Ok(MonitorOutcome::Finalized(ExecutionStatus::Failed))
            }
        }
    }

    /// Timeout path: stop the container, mark `timedout`, treat as failure
    async fn time_out(
        &self,
        job_id: JobId,
        execution: &Execution,
        container_id: &str,
        elapsed_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<MonitorOutcome> {
        let host = execution.container_host.clone().unwrap_or_default();
        let runtime = self.ctx.runtime(&host)?;
        if let Err(e) = runtime.stop(container_id).await {
            warn!(container_id = %container_id, "stop on timeout failed: {}", e);
        }
        let logs = self.capture_logs(&host, container_id).await?;

        let mut timed_out = execution.clone();
        timed_out.status = ExecutionStatus::TimedOut;
        timed_out.finished_at = Some(now);
        timed_out.stdout = logs.0;
        timed_out.stderr = logs.1;
        timed_out.error = Some(format!("timed out after {}s", elapsed_secs));

        let won = self.ctx.store.update_execution(job_id, &timed_out, execution.status).await?;
        if won {
            self.mark_processed(&host, container_id, &timed_out).await;
            finalize_attempt(&self.ctx, job_id, execution.execution_id, ExecutionStatus::TimedOut, now)
                .await?;
            warn!(job_id = %job_id, execution_id = %execution.execution_id, "execution timed out");
        }
        Ok(MonitorOutcome::Finalized(ExecutionStatus::TimedOut))
    }

    /// Finalize a stopped execution: capture logs, stamp, hand to the pruner
    async fn finalize_stopped(
        &self,
        job_id: JobId,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut finished = execution.clone();
        finished.finished_at = Some(now);

        if let Some(container_id) = &execution.container_id {
            let host = execution.container_host.clone().unwrap_or_default();
            let logs = self.capture_logs(&host, container_id).await?;
            finished.stdout = logs.0;
            finished.stderr = logs.1;
            let won = self
                .ctx
                .store
                .update_execution(job_id, &finished, ExecutionStatus::Stopped)
                .await?;
            if won {
                self.mark_processed(&host, container_id, &finished).await;
                finalize_attempt(&self.ctx, job_id, execution.execution_id, ExecutionStatus::Stopped, now)
                    .await?;
            }
        } else {
            let won = self
                .ctx
                .store
                .update_execution(job_id, &finished, ExecutionStatus::Stopped)
                .await?;
            if won {
                finalize_attempt(&self.ctx, job_id, execution.execution_id, ExecutionStatus::Stopped, now)
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark an attempt failed without exit info
    async fn fail_attempt(
        &self,
        job_id: JobId,
        execution: &Execution,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut failed = execution.clone();
        failed.status = ExecutionStatus::Failed;
        failed.finished_at = Some(now);
        failed.error = Some(error.to_string());

        let won = self.ctx.store.update_execution(job_id, &failed, execution.status).await?;
        if won {
            warn!(job_id = %job_id, execution_id = %execution.execution_id, "execution failed: {}", error);
            finalize_attempt(&self.ctx, job_id, execution.execution_id, ExecutionStatus::Failed, now)
                .await?;
        }
        Ok(())
    }

    /// Last-N-bytes capture; transient log fetch trouble propagates so the
    /// message redelivers before any state is written
    async fn capture_logs(&self, host: &str, container_id: &str) -> Result<(String, String)> {
        let tail = self.ctx.config.monitor.logs_tail_bytes;
        let runtime = self.ctx.runtime(host)?;
        match runtime.logs(container_id, tail).await {
            Ok(logs) => Ok((tail_bytes(&logs.stdout, tail), tail_bytes(&logs.stderr, tail))),
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                warn!(container_id = %container_id, "log capture failed: {}", e);
                Ok((String::new(), String::new()))
            }
        }
    }

    /// Rename the container so the pruner can reclaim it; best effort
    async fn mark_processed(&self, host: &str, container_id: &str, execution: &Execution) {
        if let Ok(runtime) = self.ctx.runtime(host) {
            if let Err(e) = runtime.rename(container_id, &execution.processed_name()).await {
                debug!(container_id = %container_id, "rename for pruner failed: {}", e);
            }
        }
    }
}

/// Terminal-transition bookkeeping shared by monitor and runner: decide
/// retry vs final, re-arm cron triggers, emit terminal events.
pub async fn finalize_attempt(
    ctx: &Arc<Context>,
    job_id: JobId,
    execution_id: ExecutionId,
    final_status: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = match ctx.store.get_job(job_id).await? {
        Some(job) => job,
        None => return Ok(()),
    };
    let stopped = job.status == JobStatus::Stopped;

    match final_status {
        ExecutionStatus::Done => {
            if job.schedule.is_recurring() && !stopped {
                rearm_cron(ctx, &job, now).await?;
            } else if !stopped {
                ctx.store.set_job_status(job_id, JobStatus::Done).await?;
            }
            emit_terminal_events(ctx, job_id, JobStatus::Done, Some(execution_id)).await
        }
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => {
            let retryable = !stopped && !job.spec.is_expired(now) && job.retry_budget_left();
            if retryable {
                ctx.store.set_job_status(job_id, JobStatus::Enqueued).await?;
                let attempt = job.executions_count().saturating_sub(1) as u32;
                let delay = ctx.config.retry.delay(attempt);
                push_message(ctx.queues.jobs.as_ref(), &JobMessage::new(job_id), delay).await?;
                info!(
                    job_id = %job_id,
                    attempt = job.executions_count(),
                    allowed = job.attempts_allowed(),
                    delay_secs = delay.as_secs(),
                    "attempt failed, retry enqueued"
                );
                Ok(())
            } else if job.schedule.is_recurring() && !stopped {
                rearm_cron(ctx, &job, now).await?;
                emit_terminal_events(ctx, job_id, JobStatus::Failed, Some(execution_id)).await
            } else {
                if !stopped {
                    ctx.store.set_job_status(job_id, JobStatus::Failed).await?;
                }
                emit_terminal_events(ctx, job_id, JobStatus::Failed, Some(execution_id)).await
            }
        }
        ExecutionStatus::Stopped => {
            ctx.store.set_job_status(job_id, JobStatus::Stopped).await?;
            emit_terminal_events(ctx, job_id, JobStatus::Stopped, Some(execution_id)).await
        }
        ExecutionStatus::Expired => {
            ctx.store.set_job_status(job_id, JobStatus::Expired).await?;
            emit_terminal_events(ctx, job_id, JobStatus::Expired, Some(execution_id)).await
        }
        _ => Ok(()),
    }
}

/// Arm the next cron fire; the trigger may already point past `now` if the
/// scheduler advanced it while this execution ran
async fn rearm_cron(ctx: &Arc<Context>, job: &crate::models::Job, now: DateTime<Utc>) -> Result<()> {
    let expr = match job.schedule.cron_expr() {
        Some(expr) => expr,
        None => return Ok(()),
    };
    let next = match job.next_trigger_at {
        Some(at) if at > now => at,
        _ => next_cron_fire(expr, now)?,
    };
    ctx.store.rearm_trigger(job.job_id, next).await?;
    debug!(job_id = %job.job_id, next = %next, "cron re-armed");
    Ok(())
}
