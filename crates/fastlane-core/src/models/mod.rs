//! Durable model: Tasks, Jobs, Executions
//!
//! Entities are stored by stable IDs only and navigated through Store
//! indexes; no in-memory back-pointers are held beyond one operation.

pub mod execution;
pub mod job;
pub mod task;

pub use execution::{Execution, ExecutionId, ExecutionStatus};
pub use job::{Job, JobId, JobSpec, JobStatus, NotifyTargets, Schedule};
pub use task::{Task, TaskId};

/// Placeholder value substituted for blacklisted env values in any
/// externally-rendered form.
pub const REDACTED: &str = "***";

/// Redact env values whose name matches the configured blacklist.
///
/// Matching is case-insensitive substring on the variable name, so a
/// blacklist entry `TOKEN` hides `API_TOKEN` and `github_token` alike.
pub fn redact_envs(
    envs: &std::collections::BTreeMap<String, String>,
    blacklist: &[String],
) -> std::collections::BTreeMap<String, String> {
    envs.iter()
        .map(|(name, value)| {
            let upper = name.to_uppercase();
            let hidden = blacklist.iter().any(|entry| upper.contains(&entry.to_uppercase()));
            if hidden {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_redact_envs() {
        let mut envs = BTreeMap::new();
        envs.insert("PATH".to_string(), "/usr/bin".to_string());
        envs.insert("API_TOKEN".to_string(), "hunter2".to_string());
        envs.insert("db_password".to_string(), "hunter2".to_string());

        let blacklist = vec!["TOKEN".to_string(), "PASSWORD".to_string()];
        let redacted = redact_envs(&envs, &blacklist);

        assert_eq!(redacted["PATH"], "/usr/bin");
        assert_eq!(redacted["API_TOKEN"], REDACTED);
        assert_eq!(redacted["db_password"], REDACTED);
    }
}
