//! Docker host driver backed by bollard

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tracing::debug;

use crate::runtime::{
    ContainerInfo, ContainerLogs, ContainerRuntime, ContainerState, RuntimeError, RuntimeResult,
};

/// Seconds before a daemon request is considered hung
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Grace period given to a container on stop
const STOP_GRACE_SECS: i64 = 10;

/// One Docker daemon, addressed by the host identifier from the pool config
pub struct DockerRuntime {
    /// Host identifier (the configured endpoint)
    host: String,

    /// bollard client
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to a daemon endpoint (`unix://...` or `tcp://host:port`)
    pub fn connect(host: &str) -> RuntimeResult<Self> {
        let docker = if host.starts_with("unix://") {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        .map_err(|e| RuntimeError::Unavailable(format!("{}: {}", host, e)))?;

        Ok(Self { host: host.to_string(), docker })
    }

    /// The host identifier this driver talks to
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Split a command line into argv, honoring single and double quotes
pub fn split_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (c, quote) {
            (q, Some(open)) if q == open => quote = None,
            ('\'' | '"', None) => quote = Some(c),
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn map_docker_err(host: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            match status_code {
                404 => RuntimeError::NotFound(message),
                401 | 403 => RuntimeError::Unauthorized(message),
                400 | 409 => RuntimeError::Invalid(message),
                // daemon trouble and registry rate limits clear on retry
                _ => RuntimeError::Unavailable(format!("{}: {} {}", host, status_code, message)),
            }
        }
        other => RuntimeError::Unavailable(format!("{}: {}", host, other)),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        debug!(host = %self.host, image = %image, "pulling image");

        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| map_docker_err(&self.host, e))?;
        }
        Ok(())
    }

    async fn create(
        &self,
        image: &str,
        command: &str,
        envs: &BTreeMap<String, String>,
    ) -> RuntimeResult<String> {
        let env: Vec<String> = envs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let config = ContainerConfig::<String> {
            image: Some(image.to_string()),
            cmd: Some(split_command(command)),
            env: Some(env),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<bollard::container::CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| map_docker_err(&self.host, e))?;

        debug!(host = %self.host, container_id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_err(&self.host, e))
    }

    async fn stop(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| map_docker_err(&self.host, e))
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<ContainerInfo> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_err(&self.host, e))?;

        use bollard::models::ContainerStateStatusEnum as S;
        let (state, exit_code) = match response.state {
            Some(state) => {
                let mapped = match state.status {
                    Some(S::CREATED) => ContainerState::Created,
                    Some(S::RUNNING) | Some(S::PAUSED) | Some(S::RESTARTING) => {
                        ContainerState::Running
                    }
                    Some(S::EXITED) => ContainerState::Exited,
                    _ => ContainerState::Gone,
                };
                (mapped, state.exit_code)
            }
            None => (ContainerState::Gone, None),
        };

        Ok(ContainerInfo { state, exit_code })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> RuntimeResult<ContainerLogs> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut logs = ContainerLogs::default();
        let mut stream = self.docker.logs(container_id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| map_docker_err(&self.host, e))? {
                LogOutput::StdOut { message } => logs.stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => logs.stderr.extend_from_slice(&message),
                LogOutput::Console { message } => logs.stdout.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }

        truncate_to_tail(&mut logs.stdout, tail);
        truncate_to_tail(&mut logs.stderr, tail);
        Ok(logs)
    }

    async fn rename(&self, container_id: &str, name: &str) -> RuntimeResult<()> {
        self.docker
            .rename_container(container_id, RenameContainerOptions { name: name.to_string() })
            .await
            .map_err(|e| map_docker_err(&self.host, e))
    }

    async fn list(&self, name_prefix: &str) -> RuntimeResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_prefix.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_docker_err(&self.host, e))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn remove(&self, container_id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
            .map_err(|e| map_docker_err(&self.host, e))
    }
}

/// Drop all but the last `tail` bytes in place
fn truncate_to_tail(buf: &mut Vec<u8>, tail: usize) {
    if buf.len() > tail {
        buf.drain(..buf.len() - tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_plain() {
        assert_eq!(split_command("echo hi"), vec!["echo", "hi"]);
        assert_eq!(split_command("  sleep   5 "), vec!["sleep", "5"]);
    }

    #[test]
    fn test_split_command_quotes() {
        assert_eq!(
            split_command(r#"sh -c "echo hi && sleep 1""#),
            vec!["sh", "-c", "echo hi && sleep 1"]
        );
        assert_eq!(split_command("echo 'a b'"), vec!["echo", "a b"]);
    }

    #[test]
    fn test_truncate_to_tail() {
        let mut buf = b"0123456789".to_vec();
        truncate_to_tail(&mut buf, 4);
        assert_eq!(buf, b"6789");

        let mut short = b"ab".to_vec();
        truncate_to_tail(&mut short, 4);
        assert_eq!(short, b"ab");
    }
}
