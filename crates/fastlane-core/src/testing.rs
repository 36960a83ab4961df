//! Test harness: an engine wired to in-memory backends
//!
//! Scenario tests drive the queue handlers directly instead of spawning
//! worker tasks, so every step is deterministic; delays are asserted on the
//! queues' visibility timestamps and collapsed explicitly where a test
//! stands in for the passage of time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::context::Context;
use crate::models::{Job, JobId, JobStatus};
use crate::notifier::Notifier;
use crate::queue::{MemoryQueue, Queue, QueueName, WorkQueues};
use crate::runtime::{ContainerRuntime, FakeRuntime};
use crate::store::MemoryStore;
use crate::worker::handle_delivery;
use crate::{Error, Result};

/// Notifier that records what it is told
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(JobId, JobStatus)>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal events seen so far
    pub fn events(&self) -> Vec<(JobId, JobStatus)> {
        self.events.lock().unwrap().clone()
    }

    /// Reported errors seen so far
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job: &Job, status: JobStatus) -> Result<()> {
        self.events.lock().unwrap().push((job.job_id, status));
        Ok(())
    }

    async fn report_error(&self, context: &str, error: &Error) {
        self.errors.lock().unwrap().push(format!("{}: {}", context, error));
    }
}

/// An engine over in-memory store, queues and scripted runtimes
pub struct TestHarness {
    /// Shared context, as workers would hold it
    pub ctx: Arc<Context>,

    /// Concrete store handle
    pub store: Arc<MemoryStore>,

    /// Concrete queue handles, for visibility assertions
    pub jobs: Arc<MemoryQueue>,
    pub monitor: Arc<MemoryQueue>,
    pub webhooks: Arc<MemoryQueue>,
    pub notify: Arc<MemoryQueue>,

    /// Scripted runtime per host
    pub runtimes: HashMap<String, Arc<FakeRuntime>>,

    /// Recording notifier handle
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    /// Default config, a single host
    pub fn new() -> Self {
        Self::with_hosts(Config::default(), &["host-a"])
    }

    /// Custom config; `config.docker.default_hosts` is overwritten with the
    /// given hosts, each backed by a fresh FakeRuntime
    pub fn with_hosts(mut config: Config, hosts: &[&str]) -> Self {
        config.docker.default_hosts = hosts.iter().map(|h| h.to_string()).collect();

        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryQueue::new(QueueName::Jobs.as_str()));
        let monitor = Arc::new(MemoryQueue::new(QueueName::Monitor.as_str()));
        let webhooks = Arc::new(MemoryQueue::new(QueueName::Webhooks.as_str()));
        let notify = Arc::new(MemoryQueue::new(QueueName::Notify.as_str()));
        let queues = WorkQueues {
            jobs: jobs.clone(),
            monitor: monitor.clone(),
            webhooks: webhooks.clone(),
            notify: notify.clone(),
        };

        let mut runtimes: HashMap<String, Arc<FakeRuntime>> = HashMap::new();
        let mut dyn_runtimes: HashMap<String, Arc<dyn ContainerRuntime>> = HashMap::new();
        for host in config.docker.all_hosts() {
            let runtime = Arc::new(FakeRuntime::new());
            runtimes.insert(host.clone(), runtime.clone());
            dyn_runtimes.insert(host, runtime);
        }

        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = Context::assemble(
            config,
            store.clone(),
            queues,
            dyn_runtimes,
            notifier.clone(),
        )
        .expect("test context");

        Self { ctx, store, jobs, monitor, webhooks, notify, runtimes, notifier }
    }

    /// The scripted runtime for a host
    pub fn runtime(&self, host: &str) -> Arc<FakeRuntime> {
        self.runtimes.get(host).expect("unknown test host").clone()
    }

    fn queues(&self) -> [(&Arc<MemoryQueue>, QueueName); 4] {
        [
            (&self.jobs, QueueName::Jobs),
            (&self.monitor, QueueName::Monitor),
            (&self.webhooks, QueueName::Webhooks),
            (&self.notify, QueueName::Notify),
        ]
    }

    /// Handle every currently-due message once, the way a worker would
    /// (ack on success, release on failure). Returns how many were handled.
    pub async fn drain_due(&self) -> usize {
        let visibility = Duration::from_secs(30);
        let mut handled = 0;
        for _ in 0..1000 {
            let mut progressed = false;
            for (queue, name) in self.queues() {
                // one message per queue per round keeps a persistently
                // failing handler from spinning this loop forever
                if let Some(delivery) = queue.pop(visibility).await.expect("pop") {
                    match handle_delivery(&self.ctx, name, &delivery).await {
                        Ok(()) => queue.ack(&delivery).await.expect("ack"),
                        Err(_) => queue.release(&delivery).await.expect("release"),
                    }
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        handled
    }

    /// Collapse every pending delay; stands in for the passage of time
    pub fn release_delays(&self) {
        for (queue, _) in self.queues() {
            queue.make_all_visible();
        }
    }

    /// Release delays and drain, repeatedly, until the queues are empty.
    /// Returns how many messages were handled in total.
    pub async fn settle(&self) -> usize {
        let mut handled = 0;
        for _ in 0..100 {
            self.release_delays();
            let round = self.drain_due().await;
            handled += round;
            if round == 0 {
                break;
            }
        }
        handled
    }

    /// Total messages sitting in all queues
    pub async fn queued_total(&self) -> usize {
        let mut total = 0;
        for (queue, _) in self.queues() {
            total += queue.len().await.expect("len");
        }
        total
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
