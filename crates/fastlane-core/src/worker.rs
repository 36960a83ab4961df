//! Worker loop: drain the queues and route to the engine components
//!
//! A worker owns one queue. It pops, bumps the in-flight gauge, runs the
//! handler under a per-handler timeout, acks on success and releases on
//! failure (the message reappears after the visibility timeout). Handler
//! errors go to the notifier's error channel and never kill the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::dispatcher::{select_host, Dispatch};
use crate::models::{redact_envs, ExecutionId, ExecutionStatus, JobId, JobStatus};
use crate::monitor::{finalize_attempt, Monitor, MonitorOutcome};
use crate::queue::{
    decode_message, push_message, Delivery, JobMessage, MonitorMessage, NotifyMessage, Queue,
    QueueName, WebhookMessage,
};
use crate::notifier::Notifier;
use crate::runner::Runner;
use crate::store::Store;
use crate::Result;

/// Spawn the configured worker pool for every queue
pub fn spawn_workers(ctx: Arc<Context>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let counts = [
        (QueueName::Jobs, ctx.config.worker.jobs_workers),
        (QueueName::Monitor, ctx.config.worker.monitor_workers),
        (QueueName::Webhooks, ctx.config.worker.webhooks_workers),
        (QueueName::Notify, ctx.config.worker.notify_workers),
    ];
    for (queue, count) in counts {
        for index in 0..count {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(ctx, queue, index, shutdown).await;
            }));
        }
    }
    handles
}

async fn worker_loop(
    ctx: Arc<Context>,
    queue_name: QueueName,
    index: usize,
    shutdown: watch::Receiver<bool>,
) {
    let queue = ctx.queues.get(queue_name).clone();
    let visibility = Duration::from_secs(ctx.config.worker.visibility_timeout_secs);
    let handler_timeout = Duration::from_secs(ctx.config.worker.handler_timeout_secs);
    let idle = Duration::from_millis(ctx.config.worker.idle_poll_ms);

    info!(queue = queue_name.as_str(), index = index, "worker running");

    loop {
        // drain on shutdown: stop pulling, in-flight work already finished
        if *shutdown.borrow() {
            info!(queue = queue_name.as_str(), index = index, "worker drained");
            return;
        }

        match queue.pop(visibility).await {
            Ok(Some(delivery)) => {
                let metrics = ctx.metrics.queue(queue_name);
                metrics.message_started();

                let handled =
                    tokio::time::timeout(handler_timeout, handle_delivery(&ctx, queue_name, &delivery))
                        .await;

                let success = matches!(handled, Ok(Ok(())));
                match handled {
                    Ok(Ok(())) => {
                        if let Err(e) = queue.ack(&delivery).await {
                            error!(queue = queue_name.as_str(), "ack failed: {}", e);
                        }
                    }
                    Ok(Err(e)) => {
                        ctx.notifier.report_error(queue_name.as_str(), &e).await;
                        if let Err(release_err) = queue.release(&delivery).await {
                            error!(queue = queue_name.as_str(), "release failed: {}", release_err);
                        }
                    }
                    Err(_elapsed) => {
                        let e = crate::Error::Other(format!(
                            "{} handler exceeded {}s",
                            queue_name.as_str(),
                            handler_timeout.as_secs()
                        ));
                        ctx.notifier.report_error(queue_name.as_str(), &e).await;
                        if let Err(release_err) = queue.release(&delivery).await {
                            error!(queue = queue_name.as_str(), "release failed: {}", release_err);
                        }
                    }
                }
                metrics.message_finished(success);
            }
            Ok(None) => {
                tokio::time::sleep(idle).await;
            }
            Err(e) => {
                ctx.notifier.report_error(queue_name.as_str(), &e).await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Decode and route one message. Unparseable messages are dropped (acked),
/// not redelivered forever.
pub async fn handle_delivery(
    ctx: &Arc<Context>,
    queue_name: QueueName,
    delivery: &Delivery,
) -> Result<()> {
    match queue_name {
        QueueName::Jobs => match decode_message::<JobMessage>(delivery) {
            Ok(message) => handle_job_message(ctx, message).await,
            Err(e) => drop_poison(ctx, queue_name, e).await,
        },
        QueueName::Monitor => match decode_message::<MonitorMessage>(delivery) {
            Ok(message) => handle_monitor_message(ctx, message).await,
            Err(e) => drop_poison(ctx, queue_name, e).await,
        },
        QueueName::Webhooks => match decode_message::<WebhookMessage>(delivery) {
            Ok(message) => handle_webhook_message(ctx, message).await,
            Err(e) => drop_poison(ctx, queue_name, e).await,
        },
        QueueName::Notify => match decode_message::<NotifyMessage>(delivery) {
            Ok(message) => handle_notify_message(ctx, message).await,
            Err(e) => drop_poison(ctx, queue_name, e).await,
        },
    }
}

async fn drop_poison(ctx: &Arc<Context>, queue: QueueName, error: crate::Error) -> Result<()> {
    ctx.notifier.report_error(queue.as_str(), &error).await;
    Ok(())
}

/// Dispatch a ready job: pick a host and hand it to the runner.
///
/// Saturated pools and transient infrastructure requeue the message with
/// back-off instead of failing the job.
pub async fn handle_job_message(ctx: &Arc<Context>, message: JobMessage) -> Result<()> {
    let now = Utc::now();
    let job = match ctx.store.get_job(message.job_id).await? {
        Some(job) => job,
        None => {
            debug!(job_id = %message.job_id, "job message for unknown job dropped");
            return Ok(());
        }
    };

    // the store wins over a stale queue hint
    if job.status.is_terminal() {
        return Ok(());
    }

    if job.spec.is_expired(now) && job.active_execution().is_none() {
        info!(job_id = %job.job_id, "job expired before start");
        ctx.store.set_job_status(job.job_id, JobStatus::Expired).await?;
        ctx.store.clear_trigger(job.job_id).await?;
        return emit_terminal_events(ctx, job.job_id, JobStatus::Expired, None).await;
    }

    let runner = Runner::new(ctx.clone());

    // at most one non-terminal execution per job: a duplicate delivery
    // resumes or re-observes, never double-launches
    if let Some(active) = job.active_execution().cloned() {
        if active.container_id.is_some() {
            return push_message(
                ctx.queues.monitor.as_ref(),
                &MonitorMessage { job_id: job.job_id, execution_id: active.execution_id },
                Duration::ZERO,
            )
            .await;
        }
        let result = runner.resume(job.job_id, active).await;
        return handle_runner_result(ctx, &message, job.job_id, result).await;
    }

    let occupancy = ctx.store.running_count_by_host().await?;
    match select_host(&ctx.pools, &ctx.health, &job.task_id, &occupancy, now) {
        Dispatch::Saturated => requeue_job(ctx, &message).await,
        Dispatch::Host(host) => {
            let result = runner.launch(&job, &host).await;
            handle_runner_result(ctx, &message, job.job_id, result).await
        }
    }
}

/// Requeue a job message under the saturation/transient back-off schedule
async fn requeue_job(ctx: &Arc<Context>, message: &JobMessage) -> Result<()> {
    let delay = ctx.config.requeue.delay(message.requeues);
    debug!(
        job_id = %message.job_id,
        requeues = message.requeues,
        delay_secs = delay.as_secs(),
        "job requeued"
    );
    push_message(
        ctx.queues.jobs.as_ref(),
        &JobMessage { job_id: message.job_id, requeues: message.requeues + 1 },
        delay,
    )
    .await
}

/// Transient runner trouble requeues up to the configured ceiling, then
/// surfaces and consumes the attempt.
async fn handle_runner_result(
    ctx: &Arc<Context>,
    message: &JobMessage,
    job_id: JobId,
    result: Result<()>,
) -> Result<()> {
    let error = match result {
        Ok(()) => return Ok(()),
        Err(e) if e.is_transient() => e,
        Err(e) => return Err(e),
    };

    if message.requeues < ctx.config.worker.transient_ceiling {
        warn!(job_id = %job_id, "transient runner failure, requeueing: {}", error);
        return requeue_job(ctx, message).await;
    }

    // ceiling exhausted: surface and consume the attempt
    ctx.notifier.report_error("runner", &error).await;
    let job = match ctx.store.get_job(job_id).await? {
        Some(job) => job,
        None => return Ok(()),
    };
    if let Some(active) = job.active_execution() {
        let mut failed = active.clone();
        failed.status = ExecutionStatus::Failed;
        failed.finished_at = Some(Utc::now());
        failed.error = Some(format!("gave up after transient failures: {}", error));
        let won = ctx.store.update_execution(job_id, &failed, active.status).await?;
        if won {
            finalize_attempt(ctx, job_id, active.execution_id, ExecutionStatus::Failed, Utc::now())
                .await?;
        }
    } else {
        ctx.store.set_job_status(job_id, JobStatus::Failed).await?;
        emit_terminal_events(ctx, job_id, JobStatus::Failed, None).await?;
    }
    Ok(())
}

/// Observe one execution and schedule the next look
pub async fn handle_monitor_message(ctx: &Arc<Context>, message: MonitorMessage) -> Result<()> {
    let monitor = Monitor::new(ctx.clone());
    match monitor.step(message.job_id, message.execution_id, Utc::now()).await? {
        MonitorOutcome::Repoll(delay) => {
            push_message(ctx.queues.monitor.as_ref(), &message, delay).await
        }
        MonitorOutcome::Finalized(_) | MonitorOutcome::NoOp => Ok(()),
    }
}

/// Deliver one webhook callback, with bounded redelivery
pub async fn handle_webhook_message(ctx: &Arc<Context>, message: WebhookMessage) -> Result<()> {
    let job = match ctx.store.get_job(message.job_id).await? {
        Some(job) => job,
        None => return Ok(()),
    };

    let execution = message
        .execution_id
        .and_then(|id| job.executions.iter().find(|e| e.execution_id == id));
    let payload = serde_json::json!({
        "task_id": job.task_id,
        "job_id": job.job_id.to_string(),
        "status": job.status,
        "metadata": job.spec.metadata,
        "envs": redact_envs(&job.spec.envs, &ctx.config.env_blacklist),
        "execution": execution.map(|e| serde_json::json!({
            "execution_id": e.execution_id.to_string(),
            "status": e.status,
            "exit_code": e.exit_code,
            "started_at": e.started_at,
            "finished_at": e.finished_at,
            "error": e.error,
        })),
    });

    let outcome = ctx
        .http
        .post(message.url.as_str())
        .json(&payload)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match outcome {
        Ok(_) => {
            debug!(job_id = %message.job_id, url = %message.url, "webhook delivered");
            Ok(())
        }
        Err(e) if message.attempts < ctx.config.worker.transient_ceiling => {
            let delay = ctx.config.requeue.delay(message.attempts);
            warn!(url = %message.url, attempts = message.attempts, "webhook failed, retrying: {}", e);
            push_message(
                ctx.queues.webhooks.as_ref(),
                &WebhookMessage { attempts: message.attempts + 1, ..message },
                delay,
            )
            .await
        }
        Err(e) => {
            ctx.notifier.report_error("webhooks", &crate::Error::from(e)).await;
            Ok(())
        }
    }
}

/// Run the notifier stack for one terminal event
pub async fn handle_notify_message(ctx: &Arc<Context>, message: NotifyMessage) -> Result<()> {
    let job = match ctx.store.get_job(message.job_id).await? {
        Some(job) => job,
        None => return Ok(()),
    };
    if let Err(e) = ctx.notifier.notify(&job, message.status).await {
        // notification is best-effort; failures are reported, not retried
        ctx.notifier.report_error("notify", &e).await;
    }
    Ok(())
}

/// Fan a terminal transition out to the notify and webhooks streams
pub async fn emit_terminal_events(
    ctx: &Arc<Context>,
    job_id: JobId,
    status: JobStatus,
    execution_id: Option<ExecutionId>,
) -> Result<()> {
    let job = match ctx.store.get_job(job_id).await? {
        Some(job) => job,
        None => return Ok(()),
    };

    push_message(ctx.queues.notify.as_ref(), &NotifyMessage { job_id, status }, Duration::ZERO)
        .await?;

    for url in &job.spec.notify.webhooks {
        push_message(
            ctx.queues.webhooks.as_ref(),
            &WebhookMessage { job_id, execution_id, url: url.clone(), attempts: 0 },
            Duration::ZERO,
        )
        .await?;
    }
    Ok(())
}
