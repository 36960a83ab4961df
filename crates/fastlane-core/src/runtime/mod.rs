//! Container runtime contract
//!
//! The engine only ever talks to hosts through [`ContainerRuntime`];
//! implementations live behind it (Docker via bollard, a scripted fake for
//! tests).

pub mod docker;
pub mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

/// Runtime result type alias
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Container runtime failures, split by retry semantics
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Image or container does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Registry or daemon refused credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request was understood and rejected (bad command, bad name)
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Daemon unreachable, timed out, or rate-limited
    #[error("host unavailable: {0}")]
    Unavailable(String),

    /// Anything else the daemon reported
    #[error("runtime failure: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Transient failures are retried with back-off; permanent ones fail
    /// the execution.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but not started
    Created,

    /// Process running
    Running,

    /// Process exited
    Exited,

    /// Daemon lost track of it (dead/removing)
    Gone,
}

/// Result of inspecting a container
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Coarse lifecycle state
    pub state: ContainerState,

    /// Exit code, when exited
    pub exit_code: Option<i64>,
}

/// Captured output streams
#[derive(Debug, Clone, Default)]
pub struct ContainerLogs {
    /// Raw stdout bytes
    pub stdout: Vec<u8>,

    /// Raw stderr bytes
    pub stderr: Vec<u8>,
}

/// The contract every container host driver provides.
///
/// Operations map one-to-one onto the runner and monitor steps: pull,
/// create, start, inspect, logs, stop, rename, list, remove.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image onto the host
    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    /// Create a container; returns the container id
    async fn create(
        &self,
        image: &str,
        command: &str,
        envs: &BTreeMap<String, String>,
    ) -> RuntimeResult<String>;

    /// Start a created container
    async fn start(&self, container_id: &str) -> RuntimeResult<()>;

    /// Stop a running container
    async fn stop(&self, container_id: &str) -> RuntimeResult<()>;

    /// Observe state and exit info
    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo>;

    /// Fetch output streams, bounded to the last `tail` bytes each
    async fn logs(&self, container_id: &str, tail: usize) -> RuntimeResult<ContainerLogs>;

    /// Rename a container (marks it for the pruner)
    async fn rename(&self, container_id: &str, name: &str) -> RuntimeResult<()>;

    /// List container ids whose name carries the given prefix
    async fn list(&self, name_prefix: &str) -> RuntimeResult<Vec<String>>;

    /// Remove a container
    async fn remove(&self, container_id: &str) -> RuntimeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RuntimeError::Unavailable("conn refused".into()).is_transient());
        assert!(!RuntimeError::NotFound("no such image".into()).is_transient());
        assert!(!RuntimeError::Unauthorized("denied".into()).is_transient());
        assert!(!RuntimeError::Invalid("bad cmd".into()).is_transient());
    }
}
