//! Execution: one container invocation attempt for a Job

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique execution identifier (ordered within a Job)
pub type ExecutionId = Ulid;

/// Execution lifecycle status
///
/// Transitions within one Execution are monotone
/// (pulling -> created -> running -> terminal), never backwards; the Store
/// enforces this with compare-and-set on `(execution_id, status)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Image pull in progress
    Pulling,

    /// Container created, not yet started
    Created,

    /// Container running
    Running,

    /// Exited with code 0
    Done,

    /// Exited with non-zero code, or the container was lost
    Failed,

    /// Wall-clock limit exceeded; the container was stopped
    #[serde(rename = "timedout")]
    TimedOut,

    /// Operator stop
    Stopped,

    /// Past the job's expiration deadline before it could start
    Expired,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pulling => write!(f, "pulling"),
            ExecutionStatus::Created => write!(f, "created"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Done => write!(f, "done"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::TimedOut => write!(f, "timedout"),
            ExecutionStatus::Stopped => write!(f, "stopped"),
            ExecutionStatus::Expired => write!(f, "expired"),
        }
    }
}

impl ExecutionStatus {
    /// Check if the status is terminal (won't change)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Done
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Stopped
                | ExecutionStatus::Expired
        )
    }

    /// Check if a failed attempt of this kind consumes retry budget
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::TimedOut)
    }

    /// Lifecycle rank used to reject backwards transitions
    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pulling => 0,
            ExecutionStatus::Created => 1,
            ExecutionStatus::Running => 2,
            _ => 3,
        }
    }

    /// Whether a persisted transition from `self` to `next` is legal
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    /// Parse from the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pulling" => Some(ExecutionStatus::Pulling),
            "created" => Some(ExecutionStatus::Created),
            "running" => Some(ExecutionStatus::Running),
            "done" => Some(ExecutionStatus::Done),
            "failed" => Some(ExecutionStatus::Failed),
            "timedout" => Some(ExecutionStatus::TimedOut),
            "stopped" => Some(ExecutionStatus::Stopped),
            "expired" => Some(ExecutionStatus::Expired),
            _ => None,
        }
    }
}

/// One container invocation attempt for a Job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique within the Job; ordered (ULIDs are monotone)
    pub execution_id: ExecutionId,

    /// Container ID, set after container create
    pub container_id: Option<String>,

    /// Chosen container host, recorded atomically with this record
    pub container_host: Option<String>,

    /// Image frozen from the Job spec at creation
    pub image: String,

    /// Command frozen from the Job spec at creation
    pub command: String,

    /// Envs frozen from the Job spec at creation
    pub envs: BTreeMap<String, String>,

    /// Lifecycle status
    pub status: ExecutionStatus,

    /// Started timestamp (container start)
    pub started_at: Option<DateTime<Utc>>,

    /// Finished timestamp (terminal transition)
    pub finished_at: Option<DateTime<Utc>>,

    /// Container exit code, when it exited
    pub exit_code: Option<i64>,

    /// Last N bytes of stdout, captured at the terminal transition
    pub stdout: String,

    /// Last N bytes of stderr, captured at the terminal transition
    pub stderr: String,

    /// Human-readable error, when applicable
    pub error: Option<String>,

    /// Monitor poll counter, drives the poll back-off
    pub poll_count: u32,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Create a new execution for a host, frozen from the job spec
    pub fn new(
        host: impl Into<String>,
        image: impl Into<String>,
        command: impl Into<String>,
        envs: BTreeMap<String, String>,
    ) -> Self {
        Self {
            execution_id: Ulid::new(),
            container_id: None,
            container_host: Some(host.into()),
            image: image.into(),
            command: command.into(),
            envs,
            status: ExecutionStatus::Pulling,
            started_at: None,
            finished_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            poll_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Check if this execution reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time so far, if started
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.started_at.map(|s| now - s)
    }

    /// The container name an already-monitored container is renamed to,
    /// marking it reclaimable by the pruner.
    pub fn processed_name(&self) -> String {
        format!("{}-{}-{}", crate::healer::PROCESSED_PREFIX, self.status, self.execution_id)
    }
}

/// Keep the last `tail` bytes of captured output, respecting UTF-8
/// boundaries (bytes that would split a code point are dropped).
pub fn tail_bytes(output: &[u8], tail: usize) -> String {
    if output.len() <= tail {
        return String::from_utf8_lossy(output).into_owned();
    }
    let cut = output.len() - tail;
    let tail_slice = &output[cut..];
    // Skip continuation bytes at the cut point
    let start = tail_slice
        .iter()
        .position(|b| (b & 0b1100_0000) != 0b1000_0000)
        .unwrap_or(tail_slice.len());
    String::from_utf8_lossy(&tail_slice[start..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(ExecutionStatus::Done.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Pulling.is_terminal());
    }

    #[test]
    fn test_monotone_transitions() {
        assert!(ExecutionStatus::Pulling.can_transition_to(ExecutionStatus::Created));
        assert!(ExecutionStatus::Created.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Done));
        assert!(ExecutionStatus::Pulling.can_transition_to(ExecutionStatus::Failed));

        // never backwards
        assert!(!ExecutionStatus::Running.can_transition_to(ExecutionStatus::Created));
        assert!(!ExecutionStatus::Created.can_transition_to(ExecutionStatus::Pulling));

        // terminal is final
        assert!(!ExecutionStatus::Done.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Done));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Pulling,
            ExecutionStatus::Created,
            ExecutionStatus::Running,
            ExecutionStatus::Done,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Stopped,
            ExecutionStatus::Expired,
        ] {
            assert_eq!(ExecutionStatus::parse(&status.to_string()), Some(status));
        }
    }

    #[test]
    fn test_executions_are_ordered() {
        let a = Execution::new("host-a", "alpine", "true", BTreeMap::new());
        let b = Execution::new("host-a", "alpine", "true", BTreeMap::new());
        assert!(a.execution_id <= b.execution_id);
    }

    #[test]
    fn test_tail_bytes() {
        assert_eq!(tail_bytes(b"hello\n", 1024), "hello\n");
        assert_eq!(tail_bytes(b"0123456789", 4), "6789");

        // a multi-byte code point split by the cut is dropped, not mangled
        let s = "aé".as_bytes(); // 'é' is two bytes
        assert_eq!(tail_bytes(s, 1), "");
        assert_eq!(tail_bytes(s, 2), "é");
    }
}
