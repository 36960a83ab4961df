//! Terminal-state notifications and worker error reporting
//!
//! Webhook callbacks have their own queue and handler; this module covers
//! the remaining side-channels (email, logs) behind one trait, plus the
//! registry that maps configured backend names to constructors.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info};

use crate::config::NotifyConfig;
use crate::models::{Job, JobStatus};
use crate::{Error, Result};

/// Notification side-channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A job reached a terminal state
    async fn notify(&self, job: &Job, status: JobStatus) -> Result<()>;

    /// A worker hit an unhandled failure; must never propagate
    async fn report_error(&self, context: &str, error: &Error);
}

/// Structured-log sink; always safe to enable
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, job: &Job, status: JobStatus) -> Result<()> {
        info!(
            job_id = %job.job_id,
            task_id = %job.task_id,
            status = %status,
            executions = job.executions_count(),
            "job reached terminal state"
        );
        Ok(())
    }

    async fn report_error(&self, context: &str, error: &Error) {
        error!(context = context, category = error.category(), "worker error: {}", error);
    }
}

/// Email notifications over SMTP
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    /// Build from an SMTP relay URL and from-address
    pub fn new(smtp_url: &str, from_address: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(smtp_url)
            .map_err(|e| Error::notification(format!("smtp url: {}", e)))?
            .build();
        let from = from_address
            .parse::<Mailbox>()
            .map_err(|e| Error::notification(format!("from address: {}", e)))?;
        Ok(Self { transport, from })
    }

    fn render(job: &Job, status: JobStatus) -> String {
        let last = job.latest_execution();
        format!(
            "Job {} of task {} finished as {}.\n\nExecutions: {}\nExit code: {}\n\n--- stdout (tail) ---\n{}\n--- stderr (tail) ---\n{}\n",
            job.job_id,
            job.task_id,
            status,
            job.executions_count(),
            last.and_then(|e| e.exit_code).map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            last.map(|e| e.stdout.as_str()).unwrap_or(""),
            last.map(|e| e.stderr.as_str()).unwrap_or(""),
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, job: &Job, status: JobStatus) -> Result<()> {
        if job.spec.notify.emails.is_empty() {
            return Ok(());
        }

        let body = Self::render(job, status);
        for address in &job.spec.notify.emails {
            let to = match address.parse::<Mailbox>() {
                Ok(to) => to,
                Err(e) => {
                    error!(address = %address, "skipping unparseable notify address: {}", e);
                    continue;
                }
            };
            let message = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(format!("[fastlane] {}/{} {}", job.task_id, job.job_id, status))
                .body(body.clone())
                .map_err(|e| Error::notification(e.to_string()))?;
            self.transport
                .send(message)
                .await
                .map_err(|e| Error::notification(e.to_string()))?;
        }
        Ok(())
    }

    async fn report_error(&self, context: &str, error: &Error) {
        // operational errors stay in the logs; email is for job outcomes
        tracing::error!(context = context, "worker error: {}", error);
    }
}

/// Fan-out over every configured backend
pub struct CompositeNotifier {
    backends: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    /// Compose backends; failures in one never mask the others
    pub fn new(backends: Vec<Arc<dyn Notifier>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, job: &Job, status: JobStatus) -> Result<()> {
        let mut first_error = None;
        for backend in &self.backends {
            if let Err(e) = backend.notify(job, status).await {
                error!(job_id = %job.job_id, "notify backend failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn report_error(&self, context: &str, error: &Error) {
        for backend in &self.backends {
            backend.report_error(context, error).await;
        }
    }
}

/// Build the configured notifier stack by registry name
pub fn build_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    let mut backends: Vec<Arc<dyn Notifier>> = Vec::new();
    for name in &config.backends {
        match name.as_str() {
            "log" => backends.push(Arc::new(TracingNotifier)),
            "email" => {
                let smtp_url = config
                    .smtp_url
                    .as_deref()
                    .ok_or_else(|| Error::config("email backend requires notify.smtp_url"))?;
                backends.push(Arc::new(EmailNotifier::new(smtp_url, &config.from_address)?));
            }
            other => {
                return Err(Error::config(format!("unknown notify backend '{}'", other)));
            }
        }
    }
    match backends.len() {
        1 => Ok(backends.remove(0)),
        _ => Ok(Arc::new(CompositeNotifier::new(backends))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobSpec, Schedule};

    #[tokio::test]
    async fn test_tracing_notifier_is_infallible() {
        let job = Job::new("t", JobSpec::new("alpine", "true"), Schedule::Immediate);
        let notifier = TracingNotifier;
        assert!(notifier.notify(&job, JobStatus::Done).await.is_ok());
        notifier.report_error("test", &Error::queue("down")).await;
    }

    #[test]
    fn test_registry_rejects_unknown_backend() {
        let config = NotifyConfig {
            backends: vec!["pager".to_string()],
            smtp_url: None,
            from_address: "fastlane@localhost".to_string(),
        };
        assert!(build_notifier(&config).is_err());
    }

    #[test]
    fn test_registry_email_requires_smtp() {
        let config = NotifyConfig {
            backends: vec!["email".to_string()],
            smtp_url: None,
            from_address: "fastlane@localhost".to_string(),
        };
        assert!(build_notifier(&config).is_err());
    }

    #[test]
    fn test_registry_builds_log_backend() {
        let config = NotifyConfig::default();
        assert!(build_notifier(&config).is_ok());
    }
}
