//! Scripted in-memory runtime used by the engine tests
//!
//! Containers advance one step per `inspect` call, so tests drive the
//! monitor deterministically instead of sleeping against a real daemon.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::runtime::{
    ContainerInfo, ContainerLogs, ContainerRuntime, ContainerState, RuntimeError, RuntimeResult,
};

/// What a created container will do once started
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// Inspections reported as running before the container exits
    pub polls_until_exit: u32,

    /// Exit code reported after that
    pub exit_code: i64,

    /// Scripted stdout
    pub stdout: Vec<u8>,

    /// Scripted stderr
    pub stderr: Vec<u8>,
}

impl ExecutionPlan {
    /// Exit immediately with the given code and stdout
    pub fn exits(exit_code: i64, stdout: &str) -> Self {
        Self {
            polls_until_exit: 0,
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    /// Stay running for `polls` inspections, then exit 0
    pub fn runs_for(polls: u32) -> Self {
        Self { polls_until_exit: polls, exit_code: 0, stdout: Vec::new(), stderr: Vec::new() }
    }

    /// Never exit on its own (timeout scenarios)
    pub fn runs_forever() -> Self {
        Self::runs_for(u32::MAX)
    }

    /// Attach stderr output
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.as_bytes().to_vec();
        self
    }
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self::exits(0, "")
    }
}

#[derive(Debug)]
struct FakeContainer {
    name: String,
    state: ContainerState,
    polls_left: u32,
    exit_code: Option<i64>,
    plan: ExecutionPlan,
    stop_requested: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    plans: VecDeque<ExecutionPlan>,
    pull_failures: HashMap<String, (u32, RuntimeError)>,
    pulled: Vec<String>,
}

/// Scripted container host
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    /// Create an empty fake host
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next created container's behavior (FIFO)
    pub fn push_plan(&self, plan: ExecutionPlan) {
        self.inner.lock().unwrap().plans.push_back(plan);
    }

    /// Make the next `times` pulls of `image` fail with `error`
    pub fn fail_pull(&self, image: &str, times: u32, error: RuntimeError) {
        self.inner.lock().unwrap().pull_failures.insert(image.to_string(), (times, error));
    }

    /// Images pulled so far
    pub fn pulled(&self) -> Vec<String> {
        self.inner.lock().unwrap().pulled.clone()
    }

    /// Containers currently known to the host
    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    /// Current names, sorted
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.lock().unwrap().containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    /// Force a running container to exit now with the given code
    pub fn exit_now(&self, container_id: &str, exit_code: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(container_id) {
            container.state = ContainerState::Exited;
            container.exit_code = Some(exit_code);
        }
    }

    /// Whether a stop was requested for the container
    pub fn stop_requested(&self, container_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.stop_requested)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((remaining, error)) = inner.pull_failures.get_mut(image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        inner.pulled.push(image.to_string());
        Ok(())
    }

    async fn create(
        &self,
        _image: &str,
        _command: &str,
        _envs: &BTreeMap<String, String>,
    ) -> RuntimeResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("fake-{:04}", inner.next_id);
        let plan = inner.plans.pop_front().unwrap_or_default();
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                name: id.clone(),
                state: ContainerState::Created,
                polls_left: plan.polls_until_exit,
                exit_code: None,
                plan,
                stop_requested: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.state = ContainerState::Running;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.stop_requested = true;
        if container.state != ContainerState::Exited {
            container.state = ContainerState::Exited;
            container.exit_code = Some(137);
        }
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;

        if container.state == ContainerState::Running {
            if container.polls_left == 0 {
                container.state = ContainerState::Exited;
                container.exit_code = Some(container.plan.exit_code);
            } else {
                container.polls_left -= 1;
            }
        }

        Ok(ContainerInfo { state: container.state, exit_code: container.exit_code })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> RuntimeResult<ContainerLogs> {
        let inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;

        let clip = |bytes: &[u8]| {
            if bytes.len() > tail {
                bytes[bytes.len() - tail..].to_vec()
            } else {
                bytes.to_vec()
            }
        };
        Ok(ContainerLogs {
            stdout: clip(&container.plan.stdout),
            stderr: clip(&container.plan.stderr),
        })
    }

    async fn rename(&self, container_id: &str, name: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.name = name.to_string();
        Ok(())
    }

    async fn list(&self, name_prefix: &str) -> RuntimeResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner
            .containers
            .iter()
            .filter(|(_, c)| c.name.starts_with(name_prefix))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_exit() {
        let runtime = FakeRuntime::new();
        runtime.push_plan(ExecutionPlan::exits(0, "hi\n"));

        let id = runtime.create("alpine", "echo hi", &BTreeMap::new()).await.unwrap();
        runtime.start(&id).await.unwrap();

        let info = runtime.inspect(&id).await.unwrap();
        assert_eq!(info.state, ContainerState::Exited);
        assert_eq!(info.exit_code, Some(0));

        let logs = runtime.logs(&id, 1024).await.unwrap();
        assert_eq!(logs.stdout, b"hi\n");
    }

    #[tokio::test]
    async fn test_runs_for_polls() {
        let runtime = FakeRuntime::new();
        runtime.push_plan(ExecutionPlan::runs_for(2));

        let id = runtime.create("alpine", "sleep 5", &BTreeMap::new()).await.unwrap();
        runtime.start(&id).await.unwrap();

        assert_eq!(runtime.inspect(&id).await.unwrap().state, ContainerState::Running);
        assert_eq!(runtime.inspect(&id).await.unwrap().state, ContainerState::Running);
        assert_eq!(runtime.inspect(&id).await.unwrap().state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_pull_failures_clear() {
        let runtime = FakeRuntime::new();
        runtime.fail_pull("alpine", 1, RuntimeError::Unavailable("registry flake".into()));

        assert!(runtime.pull("alpine").await.is_err());
        assert!(runtime.pull("alpine").await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_and_list() {
        let runtime = FakeRuntime::new();
        let id = runtime.create("alpine", "true", &BTreeMap::new()).await.unwrap();
        runtime.rename(&id, "fastlane-done-done-xyz").await.unwrap();

        let listed = runtime.list("fastlane-done").await.unwrap();
        assert_eq!(listed, vec![id.clone()]);

        runtime.remove(&id).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
    }
}
