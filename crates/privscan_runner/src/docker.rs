//! Docker Engine API implementation of [`ContainerEngine`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::ProcessSpec;
use crate::engine::{
    generate_container_name, ContainerControl, ContainerEngine, LogLine, LogStream,
    SpawnOptions, SpawnedContainer, OUTPUT_CHANNEL_CAPACITY,
};
use crate::error::{LaunchError, RunnerError, RunnerResult};

/// How long to wait for the log stream to finish after the container exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Docker Engine API based container engine.
pub struct DockerApiEngine {
    client: Docker,
}

impl DockerApiEngine {
    /// Connect using the local defaults (socket or named pipe).
    pub async fn new() -> RunnerResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| LaunchError::RuntimeUnavailable(e.to_string()))?;

        client
            .ping()
            .await
            .map_err(|e| LaunchError::RuntimeUnavailable(e.to_string()))?;

        Ok(Self { client })
    }

    /// Container create configuration for a spec.
    pub fn container_config(spec: &ProcessSpec, attach: bool) -> Config<String> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            mounts: Some(mounts),
            // Removed after the log stream drains
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.args.is_empty() {
                None
            } else {
                Some(spec.args.clone())
            },
            env: Some(spec.env.clone()),
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// Split `repo[:tag]` into the parts the create-image call expects.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn is_status(err: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if codes.contains(status_code)
    )
}

#[async_trait]
impl ContainerEngine for DockerApiEngine {
    fn name(&self) -> String {
        "docker-api".to_string()
    }

    async fn version(&self) -> RunnerResult<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, image: &str) -> RunnerResult<()> {
        info!("Pulling image {}", image);
        let (from_image, tag) = split_image_ref(image);

        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => return Err(LaunchError::ImagePullFailed(e.to_string()).into()),
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        options: SpawnOptions,
    ) -> RunnerResult<SpawnedContainer> {
        let attach = options.attach;
        let name = generate_container_name(&spec.name_prefix);
        debug!("Creating container {} with image {}", name, spec.image);

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(create_options), Self::container_config(spec, attach))
            .await
            .map_err(|e| -> RunnerError {
                if is_status(&e, &[404]) {
                    LaunchError::ImageNotFound(spec.image.clone()).into()
                } else {
                    LaunchError::SpawnFailed(e.to_string()).into()
                }
            })?;
        let id = container.id;

        if let Err(e) = self
            .client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            remove_container(&self.client, &id).await;
            return Err(LaunchError::SpawnFailed(e.to_string()).into());
        }
        info!("Started container {} ({})", name, &id[..id.len().min(12)]);

        let (logs_done_tx, logs_done_rx) = oneshot::channel::<()>();
        let output = if attach {
            let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            tokio::spawn(forward_logs(self.client.clone(), id.clone(), tx, logs_done_tx));
            Some(rx)
        } else {
            drop(logs_done_tx);
            None
        };

        let client = self.client.clone();
        let wait_id = id.clone();
        let exit = Box::pin(async move {
            let mut wait_stream =
                client.wait_container(&wait_id, None::<WaitContainerOptions<String>>);
            let code = match wait_stream.next().await {
                Some(Ok(exit)) => exit.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(RunnerError::Supervision(e.to_string())),
                None => {
                    return Err(RunnerError::Supervision("Container wait failed".into()));
                }
            };
            if timeout(LOG_DRAIN_TIMEOUT, logs_done_rx).await.is_err() {
                warn!("Log stream for {} did not finish", wait_id);
            }
            remove_container(&client, &wait_id).await;
            Ok(code)
        });

        Ok(SpawnedContainer {
            control: Arc::new(DockerApiControl {
                client: self.client.clone(),
                id,
            }),
            name,
            output,
            exit,
        })
    }
}

struct DockerApiControl {
    client: Docker,
    id: String,
}

#[async_trait]
impl ContainerControl for DockerApiControl {
    async fn stop(&self, grace: Duration) -> RunnerResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.client.stop_container(&self.id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or already gone
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self) -> RunnerResult<()> {
        warn!("Killing container {}", self.id);
        match self
            .client
            .kill_container(&self.id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_container(client: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = client.remove_container(id, Some(options)).await {
        if !is_status(&e, &[404, 409]) {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }
}

/// Follow the container's logs and forward them as lines.
async fn forward_logs(
    client: Docker,
    id: String,
    tx: mpsc::Sender<LogLine>,
    _done: oneshot::Sender<()>,
) {
    let options = LogsOptions::<String> {
        follow: true,
        stdout: true,
        stderr: true,
        ..Default::default()
    };

    let mut stdout = LineAssembler::default();
    let mut stderr = LineAssembler::default();
    let mut stream = client.logs(&id, Some(options));

    while let Some(result) = stream.next().await {
        let (assembler, kind, message) = match result {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                (&mut stdout, LogStream::Stdout, message)
            }
            Ok(LogOutput::StdErr { message }) => (&mut stderr, LogStream::Stderr, message),
            Ok(LogOutput::StdIn { .. }) => continue,
            Err(e) => {
                warn!("Log stream for {} failed: {}", id, e);
                break;
            }
        };
        for line in assembler.push(&message) {
            if tx.send(LogLine::new(kind, line)).await.is_err() {
                return;
            }
        }
    }

    for (assembler, kind) in [(stdout, LogStream::Stdout), (stderr, LogStream::Stderr)] {
        if let Some(line) = assembler.finish() {
            let _ = tx.send(LogLine::new(kind, line)).await;
        }
    }
}

/// Reassembles lines from arbitrarily split chunks.
#[derive(Debug, Default)]
struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::options::{EnvVar, RunConfiguration, RunOption};

    #[test]
    fn test_split_image_ref() {
        assert_eq!(split_image_ref("engine"), ("engine", "latest"));
        assert_eq!(split_image_ref("engine:1.2"), ("engine", "1.2"));
        assert_eq!(
            split_image_ref("localhost:5000/team/engine"),
            ("localhost:5000/team/engine", "latest")
        );
        assert_eq!(
            split_image_ref("ghcr.io/privscan/scan-engine:latest"),
            ("ghcr.io/privscan/scan-engine", "latest")
        );
        assert_eq!(split_image_ref("engine@sha256:abc"), ("engine@sha256:abc", ""));
    }

    #[test]
    fn test_container_config_from_spec() {
        let config = RunConfiguration::from_options([
            RunOption::Args(vec!["/app/code".into()]),
            RunOption::SourceVolume("/home/dev/project".into()),
            RunOption::EnvironmentVariables(vec![EnvVar::new("A", "1")]),
        ]);
        let spec = CommandBuilder::default().build("engine:1", &config);
        let created = DockerApiEngine::container_config(&spec, true);

        assert_eq!(created.image.as_deref(), Some("engine:1"));
        assert_eq!(created.cmd, Some(vec!["/app/code".to_string()]));
        assert_eq!(created.env, Some(vec!["A=1".to_string()]));

        let mounts = created.host_config.unwrap().mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].target.as_deref(), Some("/app/code"));
        assert_eq!(mounts[0].source.as_deref(), Some("/home/dev/project"));
    }

    #[test]
    fn test_line_assembler_handles_split_chunks() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push(b"Server run").is_empty());
        assert_eq!(
            assembler.push(b"ning at http://localhost:1234\r\ndone\npart"),
            vec!["Server running at http://localhost:1234", "done"]
        );
        assert_eq!(assembler.finish(), Some("part".to_string()));
    }
}
