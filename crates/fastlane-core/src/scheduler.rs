//! Trigger sweep: move due Jobs onto the `jobs` queue, exactly once per fire
//!
//! A periodic tick scans the trigger index. For each due job the trigger is
//! advanced with compare-and-set before anything is enqueued; the CAS write
//! is the commit point, so overlapping ticks and crashes between tick and
//! enqueue cannot double-fire.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::models::{Job, JobStatus, Schedule};
use crate::queue::{push_message, JobMessage};
use crate::store::Store;
use crate::worker::emit_terminal_events;
use crate::{Error, Result};

/// Parse a five-field cron expression (minute, hour, day-of-month, month,
/// day-of-week), evaluated in UTC.
///
/// The cron crate wants a seconds field; a five-field expression is
/// normalized by pinning seconds to zero.
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 { format!("0 {}", expr) } else { expr.to_string() };
    CronSchedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("invalid cron expression '{}': {}", expr, e)))
}

/// The next fire strictly after `after`, in UTC
pub fn next_cron_fire(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_cron(expr)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| Error::validation(format!("cron expression '{}' never fires", expr)))
}

/// Periodic sweep over the time-ordered trigger index
pub struct Scheduler {
    ctx: Arc<Context>,
}

impl Scheduler {
    /// Create a scheduler over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Tick until shutdown flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.ctx.config.scheduler.tick_secs.max(1));
        info!(period_secs = period.as_secs(), "scheduler running");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler draining");
                        return;
                    }
                }
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!("scheduler tick failed: {}", e);
            }
        }
    }

    /// One sweep; returns the number of jobs fired
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.ctx.store.due_scheduled(now, self.ctx.config.scheduler.batch).await?;
        let mut fired = 0;
        for job in due {
            match self.fire_one(&job, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.job_id, "trigger handling failed: {}", e);
                }
            }
        }
        Ok(fired)
    }

    /// Handle one due job. Returns true when the job was enqueued.
    async fn fire_one(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        let expected = match job.next_trigger_at {
            Some(at) => at,
            None => return Ok(false),
        };

        // past the deadline: terminal, notify, never enqueue
        if job.spec.is_expired(now) {
            let won = self
                .ctx
                .store
                .advance_trigger(job.job_id, expected, None, Some(JobStatus::Expired))
                .await?;
            if won {
                info!(job_id = %job.job_id, "job expired before start");
                emit_terminal_events(&self.ctx, job.job_id, JobStatus::Expired, None).await?;
            }
            return Ok(false);
        }

        let next = match &job.schedule {
            Schedule::Cron { expr } => Some(next_cron_fire(expr, now)?),
            _ => None,
        };

        // overlap suppression: the previous cycle has not finished
        // (execution in flight, or its message still queued)
        if job.schedule.is_recurring() && job.status != JobStatus::Scheduled {
            let skipped = self
                .ctx
                .store
                .advance_trigger(job.job_id, expected, next, None)
                .await?;
            if skipped {
                self.ctx.store.bump_skipped_triggers(job.job_id).await?;
                debug!(job_id = %job.job_id, "cron fire skipped: previous run still active");
            }
            return Ok(false);
        }

        // the CAS is the commit point; only the winner enqueues
        let won = self
            .ctx
            .store
            .advance_trigger(job.job_id, expected, next, Some(JobStatus::Enqueued))
            .await?;
        if !won {
            return Ok(false);
        }

        push_message(
            self.ctx.queues.jobs.as_ref(),
            &JobMessage::new(job.job_id),
            Duration::ZERO,
        )
        .await?;
        debug!(job_id = %job.job_id, "trigger fired");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_five_field() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("*/5 0 1 * 1").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cron("not cron").is_err());
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("").is_err());
    }

    #[test]
    fn test_next_fire_every_minute() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        let next = next_cron_fire("* * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_next_fire_daily() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let next = next_cron_fire("30 6 * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let exactly = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();
        let next = next_cron_fire("* * * * *", exactly).unwrap();
        assert!(next > exactly);
    }
}
