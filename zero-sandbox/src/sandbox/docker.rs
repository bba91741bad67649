//! Docker runtime implementation using bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;

use super::runtime::{ContainerRuntime, ContainerSpec, ExecRequest, ExecSession, OutputChunk};
use crate::error::{Result, SandboxError};

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the platform's local defaults (socket, named pipe or `DOCKER_HOST`).
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::BackendUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Docker) -> Self {
        Self { client }
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_swap_bytes),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            pids_limit: Some(spec.pids_limit),
            readonly_rootfs: Some(spec.readonly_rootfs),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(spec.security_opt.clone()),
            auto_remove: Some(spec.auto_remove),
            tmpfs: Some(
                spec.tmpfs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            network_mode: Some(if spec.network_disabled {
                "none".to_string()
            } else {
                "bridge".to_string()
            }),
            runtime: spec.runtime.clone(),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            ..Default::default()
        }
    }
}

/// Teardown of a container that is already stopped, gone, or being removed is not a failure.
fn is_benign_teardown_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304 | 404 | 409,
            ..
        }
    )
}

/// Split an image reference into the repository and tag the pull API takes.
/// A colon only starts a tag after the last `/`, so registry ports stay in the
/// repository. Digest references are passed whole with an empty tag.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| SandboxError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (name, tag) = split_image_ref(image);

        tracing::info!(image = %image, "Pulling sandbox image");

        let options = CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Runtime(format!("Failed to pull {image}: {e}")))?;
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(Self::host_config(spec)),
            tty: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "Docker warning: {}", warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign_teardown_error(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign_teardown_error(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_container_running(&self, id: &str) -> Result<bool> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_exec(&self, id: &str, request: &ExecRequest) -> Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(request.cmd.clone()),
            working_dir: request.working_dir.clone(),
            env: (!request.env.is_empty()).then(|| request.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self.client.create_exec(id, options).await?;

        let output = match self.client.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(SandboxError::Execution(
                    "exec started detached, no output stream".into(),
                ))
            }
        };

        let output = output
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message.to_vec()))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                    // Console output only appears with a TTY, which is never requested
                    Ok(LogOutput::Console { message }) => Some(Ok(OutputChunk::Stdout(message.to_vec()))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(SandboxError::from(e))),
                }
            })
            .boxed();

        Ok(ExecSession {
            id: exec.id,
            output,
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        let info = self.client.inspect_exec(exec_id).await?;
        Ok(info.exit_code.unwrap_or(-1))
    }
}
