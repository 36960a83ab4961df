//! Service configuration
//!
//! Loaded from a TOML file, then overridden by the environment:
//! `REDIS_URL`, `DATABASE_URL`, and `DOCKER_HOSTS` (JSON pool config).

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::{Error, Result};

/// Main fastlane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP API binding
    #[serde(default)]
    pub server: ServerConfig,

    /// Document store connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue backend connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Container host pools
    #[serde(default)]
    pub docker: DockerConfig,

    /// Worker pool sizes and message handling
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Trigger sweep
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Execution polling and log capture
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Retry-on-failure back-off
    #[serde(default = "Backoff::retry")]
    pub retry: Backoff,

    /// Pool-saturated / transient-infra requeue back-off
    #[serde(default = "Backoff::requeue")]
    pub requeue: Backoff,

    /// Env names hidden in externally-rendered forms (substring match)
    #[serde(default = "default_env_blacklist")]
    pub env_blacklist: Vec<String>,

    /// Notification side-channels
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Host circuit breaker
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Finished-container reclamation
    #[serde(default)]
    pub pruner: PrunerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            docker: DockerConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            retry: Backoff::retry(),
            requeue: Backoff::requeue(),
            env_blacklist: default_env_blacklist(),
            notify: NotifyConfig::default(),
            breaker: BreakerConfig::default(),
            pruner: PrunerConfig::default(),
        }
    }
}

/// HTTP API binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

/// Document store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_db_pool_size")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url(), max_connections: default_db_pool_size() }
    }
}

/// Queue backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key namespace prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url(), namespace: default_namespace() }
    }
}

/// One container host pool: jobs whose task id matches `match` run on
/// `hosts`, capped at `maxRunning` concurrent executions pool-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Regex matched (first-match) against the job's task id
    #[serde(rename = "match")]
    pub task_match: String,

    /// Host identifiers (docker endpoints)
    pub hosts: Vec<String>,

    /// Pool-wide cap on concurrently running executions
    #[serde(default = "default_max_running")]
    pub max_running: usize,
}

/// Container host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Matching pools, first-match wins
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Fall-through hosts for jobs no pool matches
    #[serde(default = "default_docker_hosts")]
    pub default_hosts: Vec<String>,

    /// Cap for the fall-through pool
    #[serde(default = "default_max_running")]
    pub default_max_running: usize,

    /// Administratively disabled hosts, skipped by selection
    #[serde(default)]
    pub disabled_hosts: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            default_hosts: default_docker_hosts(),
            default_max_running: default_max_running(),
            disabled_hosts: Vec::new(),
        }
    }
}

impl DockerConfig {
    /// All distinct host identifiers across pools
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .pools
            .iter()
            .flat_map(|p| p.hosts.iter().cloned())
            .chain(self.default_hosts.iter().cloned())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

/// Worker pool sizes and message handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers draining the jobs queue
    #[serde(default = "default_jobs_workers")]
    pub jobs_workers: usize,

    /// Workers draining the monitor queue
    #[serde(default = "default_monitor_workers")]
    pub monitor_workers: usize,

    /// Workers draining the webhooks queue
    #[serde(default = "default_side_workers")]
    pub webhooks_workers: usize,

    /// Workers draining the notify queue
    #[serde(default = "default_side_workers")]
    pub notify_workers: usize,

    /// Visibility timeout: a popped message reappears after this unless acked
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Per-handler wall-clock limit
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,

    /// Sleep between pops when a queue is empty, milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Bounded attempt ceiling for transient infrastructure failures
    #[serde(default = "default_transient_ceiling")]
    pub transient_ceiling: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            jobs_workers: default_jobs_workers(),
            monitor_workers: default_monitor_workers(),
            webhooks_workers: default_side_workers(),
            notify_workers: default_side_workers(),
            visibility_timeout_secs: default_visibility_timeout(),
            handler_timeout_secs: default_handler_timeout(),
            idle_poll_ms: default_idle_poll_ms(),
            transient_ceiling: default_transient_ceiling(),
        }
    }
}

/// Trigger sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sweep period, seconds
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// Due jobs taken per sweep
    #[serde(default = "default_sweep_batch")]
    pub batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: default_tick(), batch: default_sweep_batch() }
    }
}

/// Execution polling and log capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay before the first poll of a fresh execution, seconds
    #[serde(default = "default_tick")]
    pub initial_delay_secs: u64,

    /// Poll back-off schedule
    #[serde(default = "Backoff::monitor_poll")]
    pub poll: Backoff,

    /// Bytes of stdout/stderr retained per stream (last N bytes)
    #[serde(default = "default_logs_tail")]
    pub logs_tail_bytes: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_tick(),
            poll: Backoff::monitor_poll(),
            logs_tail_bytes: default_logs_tail(),
        }
    }
}

/// Notification side-channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Enabled backends, by registry name ("log", "email", "webhook")
    #[serde(default = "default_notify_backends")]
    pub backends: Vec<String>,

    /// SMTP relay for the email backend
    #[serde(default)]
    pub smtp_url: Option<String>,

    /// From address for the email backend
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backends: default_notify_backends(),
            smtp_url: None,
            from_address: default_from_address(),
        }
    }
}

/// Host circuit breaker: after `failures` consecutive runner failures the
/// host sits out selection for `cooldown_secs`. Disabled at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the host is cooled down
    #[serde(default = "default_breaker_failures")]
    pub failures: u32,

    /// Cooldown length, seconds (0 disables the breaker)
    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failures: default_breaker_failures(), cooldown_secs: default_breaker_cooldown() }
    }
}

/// Finished-container reclamation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrunerConfig {
    /// Sweep period, seconds
    #[serde(default = "default_prune_interval")]
    pub interval_secs: u64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self { interval_secs: default_prune_interval() }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Build from defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `REDIS_URL`, `DATABASE_URL` and `DOCKER_HOSTS` overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(raw) = std::env::var("DOCKER_HOSTS") {
            self.docker.pools = serde_json::from_str(&raw)
                .map_err(|e| Error::config(format!("invalid DOCKER_HOSTS: {}", e)))?;
        }
        Ok(())
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_database_url() -> String {
    "postgres://localhost/fastlane".to_string()
}

fn default_db_pool_size() -> u32 {
    10
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "fastlane".to_string()
}

fn default_docker_hosts() -> Vec<String> {
    vec!["unix:///var/run/docker.sock".to_string()]
}

fn default_max_running() -> usize {
    10
}

fn default_jobs_workers() -> usize {
    4
}

fn default_monitor_workers() -> usize {
    4
}

fn default_side_workers() -> usize {
    2
}

fn default_visibility_timeout() -> u64 {
    30
}

fn default_handler_timeout() -> u64 {
    60
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_transient_ceiling() -> u32 {
    5
}

fn default_tick() -> u64 {
    1
}

fn default_sweep_batch() -> usize {
    100
}

fn default_logs_tail() -> usize {
    2 * 1024 * 1024
}

fn default_env_blacklist() -> Vec<String> {
    vec![
        "PASSWORD".to_string(),
        "SECRET".to_string(),
        "TOKEN".to_string(),
        "KEY".to_string(),
    ]
}

fn default_notify_backends() -> Vec<String> {
    vec!["log".to_string()]
}

fn default_from_address() -> String {
    "fastlane@localhost".to_string()
}

fn default_breaker_failures() -> u32 {
    3
}

fn default_breaker_cooldown() -> u64 {
    60
}

fn default_prune_interval() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.tick_secs, 1);
        assert_eq!(config.monitor.poll, Backoff::monitor_poll());
        assert_eq!(config.retry, Backoff::retry());
        assert_eq!(config.monitor.logs_tail_bytes, 2 * 1024 * 1024);
        assert!(config.env_blacklist.iter().any(|e| e == "SECRET"));
    }

    #[test]
    fn test_pool_config_json_shape() {
        // the DOCKER_HOSTS wire shape
        let raw = r#"[{"match": "^etl-", "hosts": ["tcp://10.0.0.1:2375"], "maxRunning": 2}]"#;
        let pools: Vec<PoolConfig> = serde_json::from_str(raw).unwrap();
        assert_eq!(pools[0].task_match, "^etl-");
        assert_eq!(pools[0].hosts.len(), 1);
        assert_eq!(pools[0].max_running, 2);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            [server]
            port = 9000

            [monitor]
            logs_tail_bytes = 1024

            [retry]
            base_secs = 1.0
            max_secs = 10.0
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.monitor.logs_tail_bytes, 1024);
        assert_eq!(config.retry.base_secs, 1.0);
        // untouched sections keep defaults
        assert_eq!(config.worker.jobs_workers, 4);
    }

    #[test]
    fn test_all_hosts_dedup() {
        let docker = DockerConfig {
            pools: vec![PoolConfig {
                task_match: ".*".into(),
                hosts: vec!["b".into(), "a".into()],
                max_running: 1,
            }],
            default_hosts: vec!["a".into()],
            default_max_running: 1,
            disabled_hosts: vec![],
        };
        assert_eq!(docker.all_hosts(), vec!["a".to_string(), "b".to_string()]);
    }
}
