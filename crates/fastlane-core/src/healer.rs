//! Startup reconciliation and finished-container reclamation
//!
//! The healer re-enqueues every non-terminal execution after a crash:
//! a `monitor` message when the container id is known, a `jobs` message
//! otherwise. Duplicate enqueues are harmless; handlers re-observe state.
//! The pruner removes containers the monitor already renamed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::queue::{push_message, JobMessage, MonitorMessage};
use crate::runtime::ContainerRuntime;
use crate::store::Store;
use crate::Result;

/// Name prefix the monitor gives finished containers; the pruner reclaims
/// everything carrying it
pub const PROCESSED_PREFIX: &str = "fastlane-done";

/// What a heal pass re-enqueued
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealReport {
    /// Executions put back on the monitor stream
    pub monitors: usize,

    /// Jobs put back on the jobs stream
    pub jobs: usize,
}

/// Crash recovery and container cleanup
pub struct Healer {
    ctx: Arc<Context>,
}

impl Healer {
    /// Create a healer over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Re-enqueue orphaned work. Runs at service start; idempotent.
    pub async fn heal(&self) -> Result<HealReport> {
        let orphans = self.ctx.store.non_terminal_executions().await?;
        let mut report = HealReport::default();

        for (job_id, execution) in orphans {
            if execution.container_id.is_some() {
                push_message(
                    self.ctx.queues.monitor.as_ref(),
                    &MonitorMessage { job_id, execution_id: execution.execution_id },
                    Duration::ZERO,
                )
                .await?;
                report.monitors += 1;
            } else {
                push_message(
                    self.ctx.queues.jobs.as_ref(),
                    &JobMessage::new(job_id),
                    Duration::ZERO,
                )
                .await?;
                report.jobs += 1;
            }
        }

        if report.monitors + report.jobs > 0 {
            info!(
                monitors = report.monitors,
                jobs = report.jobs,
                "healer re-enqueued orphaned work"
            );
        }
        Ok(report)
    }

    /// Remove processed containers from every host; returns how many went
    pub async fn prune(&self) -> Result<usize> {
        let mut removed = 0;
        for host in self.ctx.hosts() {
            let runtime = self.ctx.runtime(&host)?;
            let containers = match runtime.list(PROCESSED_PREFIX).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(host = %host, "prune list failed: {}", e);
                    continue;
                }
            };
            for container_id in containers {
                match runtime.remove(&container_id).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(container_id = %container_id, "prune remove failed: {}", e),
                }
            }
        }
        if removed > 0 {
            info!(removed = removed, "pruned processed containers");
        }
        Ok(removed)
    }

    /// Periodic prune until shutdown flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.ctx.config.pruner.interval_secs.max(1));
        info!(period_secs = period.as_secs(), "pruner running");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if let Err(e) = self.prune().await {
                error!("prune pass failed: {}", e);
            }
        }
    }
}
