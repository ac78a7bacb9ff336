//! Docker engine backend

use super::{ContainerBackend, ContainerError, ContainerSpec, LogChunk};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

/// Backend talking to the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect using the platform defaults (socket, `DOCKER_HOST`)
    pub fn connect() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_error(err: BollardError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ContainerError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => ContainerError::Api {
            status: status_code,
            message,
        },
        BollardError::RequestTimeoutError => ContainerError::Timeout("request timed out".to_string()),
        BollardError::SocketNotFoundError(path) => ContainerError::Unavailable(path),
        other => ContainerError::Connection(other.to_string()),
    }
}

/// Split `repo:tag`, ignoring a colon that belongs to a registry port
fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(pos) => {
            let split = name_start + pos;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, "latest"),
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ContainerError> {
        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| ContainerError::PullFailed {
                image: image.to_string(),
                message: e.to_string(),
            })?;
            if let Some(status) = info.status {
                debug!(image = %image, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let binds = spec.binds();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: spec.working_dir.clone(),
            env: Some(spec.env_list()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(map_error)?;

        debug!(container_id = %response.id, image = %spec.image, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    fn log_stream(&self, id: &str) -> BoxStream<'static, Result<LogChunk, ContainerError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(|item| {
                item.map(|output| match output {
                    LogOutput::StdErr { message } => {
                        LogChunk::stderr(String::from_utf8_lossy(&message).into_owned())
                    }
                    other => LogChunk::stdout(String::from_utf8_lossy(&other.into_bytes()).into_owned()),
                })
                .map_err(map_error)
            })
            .boxed()
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(e)),
            None => Err(ContainerError::Connection(format!(
                "wait stream for {} ended without a status",
                id
            ))),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), ContainerError> {
        info!(container_id = %id, "Stopping container");

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ContainerError> {
        debug!(container_id = %id, "Removing container");

        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn commit_container(&self, id: &str, reference: &str) -> Result<(), ContainerError> {
        let (repo, tag) = split_reference(reference);
        let options = CommitContainerOptions {
            container: id.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            pause: true,
            ..Default::default()
        };

        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(map_error)?;

        info!(container_id = %id, image = %reference, "Committed image");
        Ok(())
    }
}
