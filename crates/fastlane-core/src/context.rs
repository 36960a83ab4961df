//! Shared process state threaded through workers
//!
//! Built once at process start, torn down on SIGTERM-driven drain. Holds
//! the client handles (store, queues, per-host runtimes, notifier) plus the
//! compiled pool set and metrics.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::dispatcher::{HostHealth, PoolSet};
use crate::metrics::EngineMetrics;
use crate::notifier::{build_notifier, Notifier};
use crate::queue::{QueueName, RedisQueue, WorkQueues};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::store::{PostgresStore, Store};
use crate::{Error, Result};

/// Everything a worker needs, by reference
pub struct Context {
    /// Service configuration
    pub config: Config,

    /// System of record
    pub store: Arc<dyn Store>,

    /// The four engine streams
    pub queues: WorkQueues,

    /// Compiled pools
    pub pools: PoolSet,

    /// Host circuit breaker state
    pub health: HostHealth,

    /// Terminal-state side-channels
    pub notifier: Arc<dyn Notifier>,

    /// Per-queue counters
    pub metrics: EngineMetrics,

    /// Webhook delivery client
    pub http: reqwest::Client,

    runtimes: HashMap<String, Arc<dyn ContainerRuntime>>,
}

impl Context {
    /// Assemble a context from already-built components.
    ///
    /// The pool set is compiled from the config here so a bad pool regex
    /// fails the process at startup, not mid-dispatch.
    pub fn assemble(
        config: Config,
        store: Arc<dyn Store>,
        queues: WorkQueues,
        runtimes: HashMap<String, Arc<dyn ContainerRuntime>>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let pools = PoolSet::from_config(&config.docker)?;
        Ok(Arc::new(Self {
            config,
            store,
            queues,
            pools,
            health: HostHealth::new(),
            notifier,
            metrics: EngineMetrics::new(),
            http: reqwest::Client::new(),
            runtimes,
        }))
    }

    /// Connect the real backends: Postgres store, Redis queues, one Docker
    /// driver per configured host, and the configured notifier stack.
    pub async fn bootstrap(config: Config) -> Result<Arc<Self>> {
        let store = PostgresStore::connect(&config.database.url, config.database.max_connections)
            .await?;
        store.migrate().await?;

        let manager = crate::queue::redis::connect(&config.redis.url).await?;
        let namespace = config.redis.namespace.clone();
        let queues = WorkQueues {
            jobs: Arc::new(RedisQueue::new(manager.clone(), &namespace, QueueName::Jobs.as_str())),
            monitor: Arc::new(RedisQueue::new(
                manager.clone(),
                &namespace,
                QueueName::Monitor.as_str(),
            )),
            webhooks: Arc::new(RedisQueue::new(
                manager.clone(),
                &namespace,
                QueueName::Webhooks.as_str(),
            )),
            notify: Arc::new(RedisQueue::new(manager, &namespace, QueueName::Notify.as_str())),
        };

        let mut runtimes: HashMap<String, Arc<dyn ContainerRuntime>> = HashMap::new();
        for host in config.docker.all_hosts() {
            let runtime = DockerRuntime::connect(&host)?;
            runtimes.insert(host, Arc::new(runtime));
        }
        info!(hosts = runtimes.len(), "container hosts connected");

        let notifier = build_notifier(&config.notify)?;

        Self::assemble(config, Arc::new(store), queues, runtimes, notifier)
    }

    /// The driver for a host identifier
    pub fn runtime(&self, host: &str) -> Result<Arc<dyn ContainerRuntime>> {
        self.runtimes
            .get(host)
            .cloned()
            .ok_or_else(|| Error::config(format!("no runtime configured for host '{}'", host)))
    }

    /// All connected host identifiers, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.runtimes.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}
