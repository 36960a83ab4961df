//! Host selection under pool-matching rules and concurrency caps
//!
//! A pool is `{match, hosts, maxRunning}`; the first pool whose regex
//! matches the job's task id serves it, with a fall-through default pool.
//! Saturated pools requeue with back-off rather than fail, so queue depth
//! reflects real contention.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, DockerConfig};
use crate::{Error, Result};

/// One compiled pool
#[derive(Debug)]
pub struct HostPool {
    /// First-match regex against the task id
    pub matcher: Regex,

    /// Host identifiers, kept sorted for deterministic tie-breaks
    pub hosts: Vec<String>,

    /// Pool-wide cap on concurrently running executions
    pub max_running: usize,
}

/// Compiled pool configuration
#[derive(Debug)]
pub struct PoolSet {
    pools: Vec<HostPool>,
    default_pool: HostPool,
    disabled: HashSet<String>,
}

impl PoolSet {
    /// Compile the docker host configuration; bad regexes are config errors
    pub fn from_config(docker: &DockerConfig) -> Result<Self> {
        let mut pools = Vec::with_capacity(docker.pools.len());
        for pool in &docker.pools {
            let matcher = Regex::new(&pool.task_match)
                .map_err(|e| Error::config(format!("pool match '{}': {}", pool.task_match, e)))?;
            let mut hosts = pool.hosts.clone();
            hosts.sort();
            pools.push(HostPool { matcher, hosts, max_running: pool.max_running });
        }

        let mut default_hosts = docker.default_hosts.clone();
        default_hosts.sort();
        let default_pool = HostPool {
            matcher: Regex::new(".*").expect("default pool matcher"),
            hosts: default_hosts,
            max_running: docker.default_max_running,
        };

        Ok(Self {
            pools,
            default_pool,
            disabled: docker.disabled_hosts.iter().cloned().collect(),
        })
    }

    /// First pool matching the task id; unmatched tasks fall through
    pub fn pool_for(&self, task_id: &str) -> &HostPool {
        self.pools
            .iter()
            .find(|pool| pool.matcher.is_match(task_id))
            .unwrap_or(&self.default_pool)
    }

    /// Whether a host is administratively disabled
    pub fn is_disabled(&self, host: &str) -> bool {
        self.disabled.contains(host)
    }
}

/// Per-host consecutive-failure breaker; a tripped host sits out selection
/// until its cooldown passes
#[derive(Debug, Default)]
pub struct HostHealth {
    failures: DashMap<String, u32>,
    cooling_until: DashMap<String, DateTime<Utc>>,
}

impl HostHealth {
    /// Create with clean slates
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a runner failure; trips the cooldown at the configured count
    pub fn record_failure(&self, host: &str, config: &BreakerConfig, now: DateTime<Utc>) {
        if config.cooldown_secs == 0 {
            return;
        }
        let mut count = self.failures.entry(host.to_string()).or_insert(0);
        *count += 1;
        if *count >= config.failures {
            let until = now + Duration::seconds(config.cooldown_secs as i64);
            warn!(host = %host, failures = *count, until = %until, "host cooling down");
            self.cooling_until.insert(host.to_string(), until);
            *count = 0;
        }
    }

    /// Record a successful container start; clears the failure streak
    pub fn record_success(&self, host: &str) {
        self.failures.remove(host);
    }

    /// Whether the host is inside a cooldown window
    pub fn is_cooling(&self, host: &str, now: DateTime<Utc>) -> bool {
        // the guard must drop before the remove below touches the same shard
        let expired = match self.cooling_until.get(host) {
            Some(until) if *until > now => return true,
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cooling_until.remove(host);
        }
        false
    }
}

/// Outcome of a selection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Run on this host
    Host(String),

    /// Pool at capacity (or no host currently usable): requeue with back-off
    Saturated,
}

/// Pick a host for a task under the pool's cap.
///
/// `occupancy` is the store's non-terminal-executions-per-host index. Least
/// loaded host wins; ties break on the lexicographically smallest
/// identifier for determinism.
pub fn select_host(
    pools: &PoolSet,
    health: &HostHealth,
    task_id: &str,
    occupancy: &HashMap<String, usize>,
    now: DateTime<Utc>,
) -> Dispatch {
    let pool = pools.pool_for(task_id);

    let pool_running: usize =
        pool.hosts.iter().map(|h| occupancy.get(h).copied().unwrap_or(0)).sum();
    if pool_running >= pool.max_running {
        debug!(task_id = %task_id, running = pool_running, cap = pool.max_running, "pool saturated");
        return Dispatch::Saturated;
    }

    let candidate = pool
        .hosts
        .iter()
        .filter(|host| !pools.is_disabled(host))
        .filter(|host| !health.is_cooling(host, now))
        .min_by_key(|host| (occupancy.get(*host).copied().unwrap_or(0), (*host).clone()));

    match candidate {
        Some(host) => Dispatch::Host(host.clone()),
        None => Dispatch::Saturated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn docker_config() -> DockerConfig {
        DockerConfig {
            pools: vec![
                PoolConfig {
                    task_match: "^etl-".to_string(),
                    hosts: vec!["tcp://etl-b:2375".to_string(), "tcp://etl-a:2375".to_string()],
                    max_running: 2,
                },
                PoolConfig {
                    task_match: "^etl".to_string(),
                    hosts: vec!["tcp://wide:2375".to_string()],
                    max_running: 5,
                },
            ],
            default_hosts: vec!["unix:///var/run/docker.sock".to_string()],
            default_max_running: 10,
            disabled_hosts: vec![],
        }
    }

    #[test]
    fn test_first_match_wins() {
        let pools = PoolSet::from_config(&docker_config()).unwrap();
        // both regexes match; the first configured pool takes it
        assert_eq!(pools.pool_for("etl-daily").hosts.len(), 2);
        assert_eq!(pools.pool_for("etlx").hosts, vec!["tcp://wide:2375"]);
    }

    #[test]
    fn test_unmatched_falls_through() {
        let pools = PoolSet::from_config(&docker_config()).unwrap();
        assert_eq!(pools.pool_for("backup").hosts, vec!["unix:///var/run/docker.sock"]);
    }

    #[test]
    fn test_bad_regex_is_config_error() {
        let mut config = docker_config();
        config.pools[0].task_match = "([".to_string();
        assert!(PoolSet::from_config(&config).is_err());
    }

    #[test]
    fn test_least_running_wins_ties_lexicographic() {
        let pools = PoolSet::from_config(&docker_config()).unwrap();
        let health = HostHealth::new();
        let now = Utc::now();

        // empty occupancy: tie, lexicographically smaller host wins
        let pick = select_host(&pools, &health, "etl-daily", &HashMap::new(), now);
        assert_eq!(pick, Dispatch::Host("tcp://etl-a:2375".to_string()));

        // load etl-a, selection moves to etl-b
        let mut occupancy = HashMap::new();
        occupancy.insert("tcp://etl-a:2375".to_string(), 1);
        let pick = select_host(&pools, &health, "etl-daily", &occupancy, now);
        assert_eq!(pick, Dispatch::Host("tcp://etl-b:2375".to_string()));
    }

    #[test]
    fn test_saturation() {
        let pools = PoolSet::from_config(&docker_config()).unwrap();
        let health = HostHealth::new();
        let now = Utc::now();

        let mut occupancy = HashMap::new();
        occupancy.insert("tcp://etl-a:2375".to_string(), 1);
        occupancy.insert("tcp://etl-b:2375".to_string(), 1);

        // aggregate 2 >= maxRunning 2
        let pick = select_host(&pools, &health, "etl-daily", &occupancy, now);
        assert_eq!(pick, Dispatch::Saturated);
    }

    #[test]
    fn test_disabled_hosts_skipped() {
        let mut config = docker_config();
        config.disabled_hosts = vec!["tcp://etl-a:2375".to_string()];
        let pools = PoolSet::from_config(&config).unwrap();
        let health = HostHealth::new();

        let pick = select_host(&pools, &health, "etl-daily", &HashMap::new(), Utc::now());
        assert_eq!(pick, Dispatch::Host("tcp://etl-b:2375".to_string()));
    }

    #[test]
    fn test_breaker_cooldown_and_recovery() {
        let pools = PoolSet::from_config(&docker_config()).unwrap();
        let health = HostHealth::new();
        let breaker = BreakerConfig { failures: 2, cooldown_secs: 60 };
        let now = Utc::now();

        health.record_failure("tcp://etl-a:2375", &breaker, now);
        assert!(!health.is_cooling("tcp://etl-a:2375", now));

        health.record_failure("tcp://etl-a:2375", &breaker, now);
        assert!(health.is_cooling("tcp://etl-a:2375", now));

        // selection avoids the cooling host
        let pick = select_host(&pools, &health, "etl-daily", &HashMap::new(), now);
        assert_eq!(pick, Dispatch::Host("tcp://etl-b:2375".to_string()));

        // cooldown expires
        let later = now + Duration::seconds(61);
        assert!(!health.is_cooling("tcp://etl-a:2375", later));
    }

    #[test]
    fn test_breaker_disabled_at_zero_cooldown() {
        let health = HostHealth::new();
        let breaker = BreakerConfig { failures: 1, cooldown_secs: 0 };
        let now = Utc::now();
        health.record_failure("h", &breaker, now);
        assert!(!health.is_cooling("h", now));
    }
}
