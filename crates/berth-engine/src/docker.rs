//! Docker Engine client built on bollard.

use crate::client::{EngineClient, LogStream};
use crate::error::{EngineError, Result};
use crate::request::ContainerRequest;
use crate::types::{ContainerId, ContainerInspection, ContainerStatus, ExecOutput, HealthState};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HealthStatusEnum, HostConfig, PortMap};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

/// [`EngineClient`] talking to a local or remote Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    host: String,
    stop_grace: Duration,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let host = std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|value| host_from_docker_url(&value))
            .unwrap_or_else(|| "localhost".to_string());
        Ok(Self {
            docker,
            host,
            stop_grace: Duration::ZERO,
        })
    }

    /// Override the host at which published ports are reachable.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Seconds the engine waits after SIGTERM before killing on stop.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn pull_if_missing(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image exists locally");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        trace!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(EngineError::ImagePull {
                        image: image.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        info!(image = %image, "Pulled image");
        Ok(())
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    #[instrument(skip(self, request), fields(image = %request.image))]
    async fn create(&self, request: &ContainerRequest) -> Result<ContainerId> {
        request.validate()?;
        if request.pull_if_missing {
            self.pull_if_missing(&request.image).await?;
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .exposed_ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();
        let labels: HashMap<String, String> = request
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let env = request.env_pairs();

        let host_config = HostConfig {
            publish_all_ports: Some(!request.exposed_ports.is_empty()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            cmd: if request.command.is_empty() {
                None
            } else {
                Some(request.command.clone())
            },
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = request.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self.docker.create_container(options, config).await?;
        let id = ContainerId::new(response.id);
        debug!(container_id = %id.short(), "Created container");
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_error(id, "start", e))?;
        debug!(container_id = %id.short(), "Started container");
        Ok(())
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerInspection> {
        let response = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(id, "inspect", e))?;

        let mut inspection = ContainerInspection::new(id.clone(), ContainerStatus::Unknown);
        if let Some(state) = response.state {
            inspection.status = state.status.map(status_from_docker).unwrap_or_default();
            inspection.oom_killed = state.oom_killed.unwrap_or(false);
            inspection.error = state.error.filter(|e| !e.is_empty());
            if inspection.status.has_exited() {
                inspection.exit_code = state.exit_code;
            }
            inspection.health = state
                .health
                .and_then(|h| h.status)
                .map(health_from_docker)
                .unwrap_or_default();
        }
        if let Some(ports) = response.network_settings.and_then(|n| n.ports) {
            inspection.ports = published_ports(&ports);
        }
        Ok(inspection)
    }

    async fn stop(&self, id: &ContainerId) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_grace.as_secs() as i64,
        };
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(id, "stop", e)),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_docker_error(id, "remove", e))?;
        debug!(container_id = %id.short(), "Removed container");
        Ok(())
    }

    async fn wait_for_exit(&self, id: &ContainerId) -> Result<i64> {
        let mut stream = Box::pin(
            self.docker
                .wait_container(id.as_str(), None::<WaitContainerOptions<String>>),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exit codes as errors
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_docker_error(id, "wait", e)),
            None => Err(EngineError::operation(
                "wait",
                id,
                "engine closed the wait stream without an exit code",
            )),
        }
    }

    fn stream_logs(&self, id: &ContainerId, follow: bool) -> LogStream {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id.as_str(), Some(options))
            .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(EngineError::from))
            .boxed()
    }

    async fn execute(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(EngineError::InvalidRequest("exec command is empty".into()));
        }
        debug!(container_id = %id.short(), cmd = ?cmd, "Executing command");

        let exec = self
            .docker
            .create_exec(
                id.as_str(),
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_error(id, "exec", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn host(&self) -> String {
        self.host.clone()
    }
}

fn map_docker_error(id: &ContainerId, operation: &'static str, err: DockerError) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(id.clone()),
        DockerError::DockerResponseServerError { message, .. } => {
            EngineError::operation(operation, id, message)
        }
        other => EngineError::Docker(other),
    }
}

fn status_from_docker(status: ContainerStateStatusEnum) -> ContainerStatus {
    match status {
        ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
        ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
        ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
        ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
        ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
        ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
        ContainerStateStatusEnum::EMPTY => ContainerStatus::Unknown,
    }
}

fn health_from_docker(status: HealthStatusEnum) -> HealthState {
    match status {
        HealthStatusEnum::STARTING => HealthState::Starting,
        HealthStatusEnum::HEALTHY => HealthState::Healthy,
        HealthStatusEnum::UNHEALTHY => HealthState::Unhealthy,
        HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => HealthState::None,
    }
}

/// First published host port for each exposed TCP port.
fn published_ports(ports: &PortMap) -> BTreeMap<u16, u16> {
    let mut published = BTreeMap::new();
    for (key, bindings) in ports {
        let Some(container_port) = key
            .strip_suffix("/tcp")
            .and_then(|port| port.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .iter()
            .flatten()
            .filter_map(|binding| binding.host_port.as_deref())
            .find_map(|port| port.parse::<u16>().ok());
        if let Some(host_port) = host_port {
            published.insert(container_port, host_port);
        }
    }
    published
}

/// Host part of a `tcp://` or `http(s)://` DOCKER_HOST; local sockets map to `None`.
fn host_from_docker_url(url: &str) -> Option<String> {
    let rest = ["tcp://", "http://", "https://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))?;
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::PortBinding;

    #[test]
    fn test_host_from_docker_url() {
        assert_eq!(
            host_from_docker_url("tcp://10.0.0.5:2375").as_deref(),
            Some("10.0.0.5")
        );
        assert_eq!(
            host_from_docker_url("https://docker.internal:2376/").as_deref(),
            Some("docker.internal")
        );
        assert_eq!(host_from_docker_url("unix:///var/run/docker.sock"), None);
        assert_eq!(host_from_docker_url("tcp://[::1]:2375").as_deref(), Some("::1"));
    }

    #[test]
    fn test_published_ports() {
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "6379/tcp".to_string(),
            Some(vec![
                PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some("49153".into()),
                },
                PortBinding {
                    host_ip: Some("::".into()),
                    host_port: Some("49153".into()),
                },
            ]),
        );
        ports.insert("53/udp".to_string(), None);
        ports.insert("8080/tcp".to_string(), None);

        let published = published_ports(&ports);
        assert_eq!(published.len(), 1);
        assert_eq!(published.get(&6379), Some(&49153));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from_docker(ContainerStateStatusEnum::EXITED),
            ContainerStatus::Exited
        );
        assert_eq!(
            health_from_docker(HealthStatusEnum::UNHEALTHY),
            HealthState::Unhealthy
        );
        assert_eq!(health_from_docker(HealthStatusEnum::EMPTY), HealthState::None);
    }
}
