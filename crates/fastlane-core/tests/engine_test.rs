//! End-to-end engine scenarios over in-memory backends
//!
//! Tests drive the queue handlers the way workers would, with scripted
//! container behavior. Delays are asserted on queue visibility timestamps
//! and collapsed explicitly where a test stands in for the passage of time.

use chrono::{Duration as ChronoDuration, Utc};
use fastlane_core::healer::Healer;
use fastlane_core::models::{Execution, ExecutionStatus, JobStatus};
use fastlane_core::queue::MonitorMessage;
use fastlane_core::runtime::fake::ExecutionPlan;
use fastlane_core::runtime::RuntimeError;
use fastlane_core::scheduler::Scheduler;
use fastlane_core::testing::TestHarness;
use fastlane_core::worker::handle_monitor_message;
use fastlane_core::{Config, JobService, JobSubmission};

fn submission(image: &str, command: &str) -> JobSubmission {
    JobSubmission {
        image: image.to_string(),
        command: command.to_string(),
        ..Default::default()
    }
}

/// Rewind the active execution's start stamp so timeout checks see an
/// elapsed run without the test sleeping.
async fn backdate_started(harness: &TestHarness, job_id: fastlane_core::JobId, secs: i64) {
    let job = harness.store_job(job_id).await;
    let active = job.active_execution().expect("active execution").clone();
    let mut rewound = active.clone();
    rewound.started_at = Some(Utc::now() - ChronoDuration::seconds(secs));
    use fastlane_core::store::Store;
    assert!(harness
        .store
        .update_execution(job_id, &rewound, active.status)
        .await
        .unwrap());
}

trait HarnessExt {
    async fn store_job(&self, job_id: fastlane_core::JobId) -> fastlane_core::Job;
}

impl HarnessExt for TestHarness {
    async fn store_job(&self, job_id: fastlane_core::JobId) -> fastlane_core::Job {
        use fastlane_core::store::Store;
        self.store.get_job(job_id).await.unwrap().expect("job in store")
    }
}

#[tokio::test]
async fn immediate_success() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "hi\n"));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("greet", submission("alpine", "echo hi")).await.unwrap();
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.executions_count(), 1);

    let execution = job.latest_execution().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Done);
    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.stdout, "hi\n");
    assert!(execution.finished_at.is_some());

    // terminal event reached the notifier
    assert!(harness.notifier.events().contains(&(job.job_id, JobStatus::Done)));

    // the container was renamed for the pruner
    let names = harness.runtime("host-a").container_names();
    assert!(names[0].starts_with("fastlane-done-done"), "got {:?}", names);
}

#[tokio::test]
async fn retry_then_success() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan::exits(1, "").with_stderr("boom\n"));
    runtime.push_plan(ExecutionPlan::exits(0, "recovered\n"));
    let service = JobService::new(harness.ctx.clone());

    let mut body = submission("alpine", "flaky");
    body.retries = 2;
    let job = service.create_job("flaky", body).await.unwrap();

    // first attempt fails...
    harness.drain_due().await;
    harness.release_delays();
    harness.drain_due().await;

    // ...and the retry waits out the failure back-off (5s base)
    let visible_at = harness.jobs.next_visible_at().expect("retry enqueued");
    let wait_ms = visible_at - Utc::now().timestamp_millis();
    assert!(wait_ms > 4_000, "retry delay too small: {}ms", wait_ms);

    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.executions_count(), 2);
    assert_eq!(job.executions[0].status, ExecutionStatus::Failed);
    assert_eq!(job.executions[0].stderr, "boom\n");
    assert_eq!(job.executions[1].status, ExecutionStatus::Done);
    assert_eq!(job.executions[1].exit_code, Some(0));
}

#[tokio::test]
async fn timeout_stops_container_and_consumes_budget() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan::runs_forever());
    runtime.push_plan(ExecutionPlan::runs_forever());
    let service = JobService::new(harness.ctx.clone());

    let mut body = submission("alpine", "sleep 60");
    body.timeout = Some(2);
    body.retries = 1;
    let job = service.create_job("sleeper", body).await.unwrap();

    // attempt 1 dispatches, then runs past its limit
    harness.drain_due().await;
    backdate_started(&harness, job.job_id, 10).await;
    harness.release_delays();
    harness.drain_due().await;

    let loaded = harness.store_job(job.job_id).await;
    let first = &loaded.executions[0];
    assert_eq!(first.status, ExecutionStatus::TimedOut);
    assert!(harness.runtime("host-a").stop_requested(first.container_id.as_deref().unwrap()));

    // attempt 2 also times out; budget is spent
    harness.release_delays();
    harness.drain_due().await;
    backdate_started(&harness, job.job_id, 10).await;
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.executions_count(), 2);
    assert!(job.executions.iter().all(|e| e.status == ExecutionStatus::TimedOut));
    assert!(harness.notifier.events().contains(&(job.job_id, JobStatus::Failed)));
}

#[tokio::test]
async fn cron_overlap_is_skipped() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan::runs_forever());
    runtime.push_plan(ExecutionPlan::runs_forever());
    let service = JobService::new(harness.ctx.clone());
    let scheduler = Scheduler::new(harness.ctx.clone());

    let mut body = submission("alpine", "slow-report");
    body.cron = Some("* * * * *".to_string());
    let job = service.create_job("report", body).await.unwrap();
    let t0 = harness.store_job(job.job_id).await.next_trigger_at.expect("armed");

    // minute 0: fire and dispatch
    assert_eq!(scheduler.tick(t0).await.unwrap(), 1);
    harness.drain_due().await;
    assert_eq!(harness.store_job(job.job_id).await.status, JobStatus::Running);

    // minute 1: previous run still going, the fire is suppressed
    assert_eq!(scheduler.tick(t0 + ChronoDuration::seconds(60)).await.unwrap(), 0);
    let loaded = harness.store_job(job.job_id).await;
    assert_eq!(loaded.skipped_triggers, 1);
    assert_eq!(loaded.executions_count(), 1);

    // the run finishes; the trigger re-arms for minute 2
    let container = loaded.executions[0].container_id.clone().unwrap();
    runtime.exit_now(&container, 0);
    harness.settle().await;
    let loaded = harness.store_job(job.job_id).await;
    assert_eq!(loaded.status, JobStatus::Scheduled);
    assert_eq!(loaded.next_trigger_at, Some(t0 + ChronoDuration::seconds(120)));

    // minute 2: fires again
    assert_eq!(scheduler.tick(t0 + ChronoDuration::seconds(120)).await.unwrap(), 1);
    harness.drain_due().await;

    let loaded = harness.store_job(job.job_id).await;
    assert_eq!(loaded.executions_count(), 2);
    assert_eq!(loaded.skipped_triggers, 1);
}

#[tokio::test]
async fn saturated_pool_requeues_until_capacity_frees() {
    let mut config = Config::default();
    config.docker.default_max_running = 1;
    let harness = TestHarness::with_hosts(config, &["host-a"]);
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan::runs_forever());
    runtime.push_plan(ExecutionPlan::exits(0, "b\n"));
    let service = JobService::new(harness.ctx.clone());

    let job_a = service.create_job("pool", submission("alpine", "sleep 5")).await.unwrap();
    let job_b = service.create_job("pool", submission("alpine", "echo b")).await.unwrap();

    harness.drain_due().await;

    // exactly one attempt started; the other message waits out a back-off
    let started = harness.store_job(job_a.job_id).await.executions_count()
        + harness.store_job(job_b.job_id).await.executions_count();
    assert_eq!(started, 1);
    let visible_at = harness.jobs.next_visible_at().expect("requeued message");
    assert!(visible_at - Utc::now().timestamp_millis() > 1_500);

    // capacity frees, the waiter dispatches
    let first = harness.store_job(job_a.job_id).await;
    let second_id = if first.executions_count() == 1 { job_b.job_id } else { job_a.job_id };
    let first_id = if first.executions_count() == 1 { job_a.job_id } else { job_b.job_id };
    let container =
        harness.store_job(first_id).await.executions[0].container_id.clone().unwrap();
    runtime.exit_now(&container, 0);
    harness.settle().await;

    let first = harness.store_job(first_id).await;
    let second = harness.store_job(second_id).await;
    assert_eq!(first.status, JobStatus::Done);
    assert_eq!(second.status, JobStatus::Done);
    assert_eq!(second.executions_count(), 1);

    // the waiter only started after the first attempt finished
    let freed_at = first.executions[0].finished_at.unwrap();
    assert!(second.executions[0].created_at >= freed_at);
}

#[tokio::test]
async fn crash_recovery_resumes_without_duplication() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan {
        polls_until_exit: u32::MAX,
        exit_code: 0,
        stdout: b"survived\n".to_vec(),
        stderr: Vec::new(),
    });
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("longrun", submission("alpine", "sleep 30")).await.unwrap();
    harness.drain_due().await;
    assert_eq!(harness.store_job(job.job_id).await.status, JobStatus::Running);

    // crash: every queued hint is lost, the store survives
    harness.jobs.purge();
    harness.monitor.purge();
    harness.webhooks.purge();
    harness.notify.purge();

    // restart: the healer re-observes the orphaned execution
    let report = Healer::new(harness.ctx.clone()).heal().await.unwrap();
    assert_eq!(report.monitors, 1);
    assert_eq!(report.jobs, 0);

    let container =
        harness.store_job(job.job_id).await.executions[0].container_id.clone().unwrap();
    runtime.exit_now(&container, 0);
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.executions_count(), 1);
    assert_eq!(job.latest_execution().unwrap().stdout, "survived\n");
}

#[tokio::test]
async fn healer_restarts_executions_without_container() {
    use fastlane_core::store::Store;

    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "late\n"));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("half", submission("alpine", "echo late")).await.unwrap();
    // a runner that died before create: record exists, no container
    let execution = Execution::new("host-a", "alpine", "echo late", Default::default());
    harness.store.append_execution(job.job_id, &execution).await.unwrap();
    harness.jobs.purge();

    let report = Healer::new(harness.ctx.clone()).heal().await.unwrap();
    assert_eq!(report.jobs, 1);

    harness.settle().await;
    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.executions_count(), 1);
    assert_eq!(job.latest_execution().unwrap().stdout, "late\n");
}

#[tokio::test]
async fn duplicate_monitor_delivery_is_idempotent() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "once\n"));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("idem", submission("alpine", "echo once")).await.unwrap();
    harness.settle().await;

    let before = serde_json::to_value(harness.store_job(job.job_id).await).unwrap();
    let execution_id = harness.store_job(job.job_id).await.executions[0].execution_id;

    // replay the monitor message twice; the store wins both times
    let message = MonitorMessage { job_id: job.job_id, execution_id };
    handle_monitor_message(&harness.ctx, message.clone()).await.unwrap();
    handle_monitor_message(&harness.ctx, message).await.unwrap();

    let after = serde_json::to_value(harness.store_job(job.job_id).await).unwrap();
    assert_eq!(before, after);
    assert_eq!(harness.queued_total().await, 0);
}

#[tokio::test]
async fn stop_finalizes_and_manual_retry_extends_budget() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.push_plan(ExecutionPlan {
        polls_until_exit: u32::MAX,
        exit_code: 0,
        stdout: b"partial\n".to_vec(),
        stderr: Vec::new(),
    });
    runtime.push_plan(ExecutionPlan::exits(0, "second\n"));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("stoppable", submission("alpine", "sleep 60")).await.unwrap();
    harness.drain_due().await;

    let stopped = service.stop_job("stoppable", job.job_id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);

    // stopping a terminal job conflicts
    let err = service.stop_job("stoppable", job.job_id).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    harness.settle().await;
    let loaded = harness.store_job(job.job_id).await;
    let first = &loaded.executions[0];
    assert_eq!(first.status, ExecutionStatus::Stopped);
    assert!(first.finished_at.is_some());
    assert_eq!(first.stdout, "partial\n");
    assert!(runtime.stop_requested(first.container_id.as_deref().unwrap()));
    assert!(harness.notifier.events().contains(&(job.job_id, JobStatus::Stopped)));

    // manual retry extends the bound past retries + 1
    service.retry_job("stoppable", job.job_id).await.unwrap();
    harness.settle().await;

    let loaded = harness.store_job(job.job_id).await;
    assert_eq!(loaded.status, JobStatus::Done);
    assert_eq!(loaded.executions_count(), 2);
    assert_eq!(loaded.latest_execution().unwrap().stdout, "second\n");
}

#[tokio::test]
async fn retry_conflicts_while_running() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::runs_forever());
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("busy", submission("alpine", "sleep 60")).await.unwrap();
    harness.drain_due().await;

    let err = service.retry_job("busy", job.job_id).await.unwrap_err();
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn scheduled_job_expires_instead_of_firing() {
    let harness = TestHarness::new();
    let service = JobService::new(harness.ctx.clone());
    let scheduler = Scheduler::new(harness.ctx.clone());

    let now = Utc::now();
    let mut body = submission("alpine", "echo late");
    body.start_at = Some(now + ChronoDuration::hours(1));
    body.expiration = Some(now + ChronoDuration::minutes(30));
    let job = service.create_job("deadline", body).await.unwrap();

    // the sweep reaches the trigger only after the deadline passed
    scheduler.tick(now + ChronoDuration::hours(2)).await.unwrap();
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Expired);
    assert_eq!(job.executions_count(), 0);
    assert!(harness.notifier.events().contains(&(job.job_id, JobStatus::Expired)));

    // an expired job cannot be retried into a fresh start
    let err = service.retry_job("deadline", job.job_id).await.unwrap_err();
    assert_eq!(err.status_code(), 409);
}

#[tokio::test]
async fn transient_pull_failure_requeues_same_attempt() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.fail_pull("alpine", 1, RuntimeError::Unavailable("registry flake".into()));
    runtime.push_plan(ExecutionPlan::exits(0, "pulled\n"));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("flaky-pull", submission("alpine", "echo ok")).await.unwrap();
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    // the same execution record was resumed, not duplicated
    assert_eq!(job.executions_count(), 1);
    assert_eq!(job.latest_execution().unwrap().stdout, "pulled\n");
}

#[tokio::test]
async fn missing_image_fails_the_execution() {
    let harness = TestHarness::new();
    let runtime = harness.runtime("host-a");
    runtime.fail_pull("ghost", u32::MAX, RuntimeError::NotFound("no such image".into()));
    let service = JobService::new(harness.ctx.clone());

    let job = service.create_job("ghostly", submission("ghost", "true")).await.unwrap();
    harness.settle().await;

    let job = harness.store_job(job.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.executions_count(), 1);
    let execution = job.latest_execution().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("pull failed"));
    assert!(harness.notifier.events().contains(&(job.job_id, JobStatus::Failed)));
}

#[tokio::test]
async fn webhook_delivery_failures_are_bounded() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "done\n"));
    let service = JobService::new(harness.ctx.clone());

    let mut body = submission("alpine", "true");
    // nothing listens on the discard port; every delivery attempt fails
    body.notify.webhooks.push("http://127.0.0.1:9/hook".to_string());
    let job = service.create_job("hooked", body).await.unwrap();
    harness.settle().await;

    // the job itself finished fine
    assert_eq!(harness.store_job(job.job_id).await.status, JobStatus::Done);

    // delivery was retried up to the ceiling, then surfaced and dropped
    assert!(harness.notifier.errors().iter().any(|e| e.starts_with("webhooks:")));
    assert_eq!(harness.queued_total().await, 0);
}

#[tokio::test]
async fn pruner_reclaims_processed_containers() {
    let harness = TestHarness::new();
    harness.runtime("host-a").push_plan(ExecutionPlan::exits(0, "done\n"));
    let service = JobService::new(harness.ctx.clone());

    service.create_job("cleanup", submission("alpine", "true")).await.unwrap();
    harness.settle().await;
    assert_eq!(harness.runtime("host-a").container_count(), 1);

    let removed = Healer::new(harness.ctx.clone()).prune().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(harness.runtime("host-a").container_count(), 0);
}
