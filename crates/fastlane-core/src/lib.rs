//! Fastlane core: the container-backed job lifecycle engine
//!
//! Clients submit named tasks whose worker is a container image plus a
//! command line; the engine enqueues, dispatches, runs, monitors, retries
//! and retains logs of those executions across a pool of container hosts.
//!
//! ## Architecture
//!
//! - **Store** (Postgres) is the system of record for Tasks, Jobs and
//!   Executions; racing writers serialize through compare-and-set.
//! - **Queues** (Redis sorted sets) carry four streams: `jobs`, `monitor`,
//!   `webhooks`, `notify`; delivery is at-least-once behind a visibility
//!   timeout, and every handler is idempotent.
//! - **Scheduler** sweeps the trigger index (cron and one-shot delays) onto
//!   the `jobs` stream, exactly once per fire.
//! - **Dispatcher** picks a host under pool-matching rules and caps;
//!   saturation requeues with back-off.
//! - **Runner** materializes an execution: pull, create, start.
//! - **Monitor** polls running containers, applies timeouts, captures logs
//!   and decides retry vs final.
//! - **Healer/Pruner** re-enqueue orphaned work after a crash and reclaim
//!   finished containers.

pub mod backoff;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod healer;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod notifier;
pub mod queue;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod testing;
pub mod worker;

// Re-export commonly used types
pub use backoff::Backoff;
pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use models::{
    Execution, ExecutionId, ExecutionStatus, Job, JobId, JobSpec, JobStatus, NotifyTargets,
    Schedule, Task, TaskId,
};
pub use service::{JobService, JobSubmission};

/// Current version of fastlane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
