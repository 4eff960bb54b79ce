//! CLI-based container engine supporting Docker and Podman.
//!
//! Containers are started with `<runtime> run --rm --name <name> ...` as a
//! child process. Stop and kill requests go through `<runtime> stop` and
//! `<runtime> kill` against the generated name, so the container is never
//! left behind when the client process is torn down.

use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::command::ProcessSpec;
use crate::config::Settings;
use crate::engine::{
    generate_container_name, ContainerControl, ContainerEngine, LogLine, LogStream,
    SpawnOptions, SpawnedContainer, OUTPUT_CHANNEL_CAPACITY,
};
use crate::error::{LaunchError, RunnerError, RunnerResult};

/// `docker run` exit code for failures of the runtime itself.
const RUNTIME_FAILURE_EXIT_CODE: i64 = 125;

/// `image inspect` errors that mean the image is absent (docker, podman).
const MISSING_IMAGE_MESSAGES: &[&str] = &["no such image", "image not known"];

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Get the CLI command name.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command())
    }
}

impl FromStr for ContainerRuntime {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(RunnerError::Settings(format!(
                "unknown container runtime '{}', expected docker or podman",
                other
            ))),
        }
    }
}

/// CLI-based engine options.
#[derive(Debug, Clone, Default)]
pub struct CliEngineOptions {
    /// Preferred runtime (if not set, auto-detect)
    pub preferred_runtime: Option<ContainerRuntime>,
    /// Explicit launcher such as `["sudo", "docker"]`; skips detection
    pub runtime_command: Vec<String>,
    /// Dry-run mode (print commands without executing)
    pub dry_run: bool,
}

impl CliEngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            preferred_runtime: settings.runtime,
            runtime_command: settings.runtime_command.clone(),
            dry_run: settings.dry_run,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn prefer_docker(mut self) -> Self {
        self.preferred_runtime = Some(ContainerRuntime::Docker);
        self
    }

    pub fn prefer_podman(mut self) -> Self {
        self.preferred_runtime = Some(ContainerRuntime::Podman);
        self
    }

    pub fn runtime_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime_command = command.into_iter().map(Into::into).collect();
        self
    }
}

/// Program plus leading arguments used for every runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Launcher {
    program: String,
    leading_args: Vec<String>,
}

impl Launcher {
    fn for_runtime(runtime: ContainerRuntime) -> Self {
        Self {
            program: runtime.command().to_string(),
            leading_args: Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }

    async fn output(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
    }
}

/// CLI-based container engine.
pub struct CliEngine {
    runtime: ContainerRuntime,
    launcher: Launcher,
    options: CliEngineOptions,
}

impl CliEngine {
    /// Create a new CLI engine with automatic runtime detection.
    pub fn new(options: CliEngineOptions) -> RunnerResult<Self> {
        if let Some((program, rest)) = options.runtime_command.split_first() {
            let runtime = options.preferred_runtime.unwrap_or(ContainerRuntime::Docker);
            info!("Using container runtime command: {}", options.runtime_command.join(" "));
            return Ok(Self {
                runtime,
                launcher: Launcher {
                    program: program.clone(),
                    leading_args: rest.to_vec(),
                },
                options,
            });
        }

        let runtime = Self::detect_runtime(&options)?;
        info!("Using container runtime: {}", runtime);
        Ok(Self::with_runtime(runtime, options))
    }

    /// Create an engine with a specific runtime.
    pub fn with_runtime(runtime: ContainerRuntime, options: CliEngineOptions) -> Self {
        Self {
            runtime,
            launcher: Launcher::for_runtime(runtime),
            options,
        }
    }

    /// Create an engine from runner settings.
    pub fn from_settings(settings: &Settings) -> RunnerResult<Self> {
        Self::new(CliEngineOptions::from_settings(settings))
    }

    /// Detect available container runtime.
    pub fn detect_runtime(options: &CliEngineOptions) -> RunnerResult<ContainerRuntime> {
        if let Some(preferred) = options.preferred_runtime {
            if Self::is_runtime_available(preferred) {
                return Ok(preferred);
            }
            warn!(
                "Preferred runtime {} not available, trying alternatives",
                preferred
            );
        }

        if Self::is_runtime_available(ContainerRuntime::Docker) {
            return Ok(ContainerRuntime::Docker);
        }

        if Self::is_runtime_available(ContainerRuntime::Podman) {
            return Ok(ContainerRuntime::Podman);
        }

        Err(LaunchError::RuntimeUnavailable(
            "Neither Docker nor Podman is available".to_string(),
        )
        .into())
    }

    fn is_runtime_available(runtime: ContainerRuntime) -> bool {
        std::process::Command::new(runtime.command())
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Get the current runtime.
    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    /// Check if dry-run mode is enabled.
    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    /// Build the `run` arguments for a spec.
    pub fn run_args(&self, spec: &ProcessSpec, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(mount.bind_spec());
        }

        for env in &spec.env {
            args.push("-e".to_string());
            args.push(env.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Format command for logging.
    pub fn format_command(&self, args: &[String]) -> String {
        let mut cmd = self.launcher.program.clone();
        for arg in self.launcher.leading_args.iter().chain(args) {
            if arg.contains(' ') || arg.contains('=') {
                cmd.push_str(&format!(" '{}'", arg));
            } else {
                cmd.push_str(&format!(" {}", arg));
            }
        }
        cmd
    }

    fn control(&self, name: &str, kill_tx: Option<oneshot::Sender<()>>) -> Arc<CliControl> {
        Arc::new(CliControl {
            launcher: self.launcher.clone(),
            name: name.to_string(),
            dry_run: self.options.dry_run,
            kill_tx: Mutex::new(kill_tx),
        })
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn name(&self) -> String {
        self.runtime.to_string()
    }

    async fn version(&self) -> RunnerResult<String> {
        if self.options.dry_run {
            return Ok(format!("{} (dry-run)", self.runtime));
        }
        let output = self
            .launcher
            .output(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| LaunchError::from_spawn_io(&self.launcher.program, e))?;

        if output.status.success() {
            let version = String::from_utf8_lossy(&output.stdout);
            Ok(format!("{} {}", self.runtime, version.trim()))
        } else {
            Err(runtime_error(&output.stderr).into())
        }
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        if self.options.dry_run {
            return Ok(true);
        }
        let output = self
            .launcher
            .output(&["image", "inspect", image])
            .await
            .map_err(|e| LaunchError::from_spawn_io(&self.launcher.program, e))?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_ascii_lowercase();
        if MISSING_IMAGE_MESSAGES.iter().any(|m| stderr.contains(m)) {
            Ok(false)
        } else {
            Err(runtime_error(&output.stderr).into())
        }
    }

    async fn pull_image(&self, image: &str) -> RunnerResult<()> {
        info!("Pulling image: {}", image);

        if self.options.dry_run {
            info!("[DRY-RUN] Would pull: {}", image);
            return Ok(());
        }

        let output = self
            .launcher
            .output(&["pull", image])
            .await
            .map_err(|e| LaunchError::from_spawn_io(&self.launcher.program, e))?;

        if output.status.success() {
            info!("Successfully pulled: {}", image);
            Ok(())
        } else {
            Err(LaunchError::ImagePullFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )
            .into())
        }
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        options: SpawnOptions,
    ) -> RunnerResult<SpawnedContainer> {
        let attach = options.attach;
        let name = generate_container_name(&spec.name_prefix);
        let args = self.run_args(spec, &name);
        let cmd_str = self.format_command(&args);

        info!("Starting container {} from {}", name, spec.image);
        debug!("Command: {}", cmd_str);

        if self.options.dry_run {
            info!("[DRY-RUN] Would execute: {}", cmd_str);
            return Ok(SpawnedContainer {
                control: self.control(&name, None),
                name,
                output: None,
                exit: Box::pin(async { Ok::<i64, RunnerError>(0) }),
            });
        }

        let mut cmd = self.launcher.command();
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        if attach {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        // Own process group only while the supervisor handles interrupts:
        // a terminal Ctrl+C then reaches us, not the client. Otherwise the
        // client gets the signal and stops the container itself.
        #[cfg(unix)]
        if options.owns_interrupts {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_spawn_io(&self.launcher.program, e))?;

        let output = if attach {
            let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_lines(stdout, LogStream::Stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_lines(stderr, LogStream::Stderr, tx));
            }
            Some(rx)
        } else {
            None
        };

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit = wait_for_exit(child, kill_rx, self.launcher.program.clone());

        Ok(SpawnedContainer {
            control: self.control(&name, Some(kill_tx)),
            name,
            output,
            exit: Box::pin(exit),
        })
    }
}

/// Stop/kill handle for a container started by [`CliEngine`].
struct CliControl {
    launcher: Launcher,
    name: String,
    dry_run: bool,
    /// Tears down the client process once fired
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl ContainerControl for CliControl {
    async fn stop(&self, grace: Duration) -> RunnerResult<()> {
        let secs = grace.as_secs().to_string();
        if self.dry_run {
            info!("[DRY-RUN] Would stop container: {}", self.name);
            return Ok(());
        }

        info!("Stopping container {} (grace {}s)", self.name, secs);
        let output = self.launcher.output(&["stop", "-t", &secs, &self.name]).await?;
        if !output.status.success() {
            debug!(
                "Stop of {} reported: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn kill(&self) -> RunnerResult<()> {
        if self.dry_run {
            info!("[DRY-RUN] Would kill container: {}", self.name);
            return Ok(());
        }

        warn!("Killing container {}", self.name);
        match self.launcher.output(&["kill", &self.name]).await {
            Ok(output) if !output.status.success() => debug!(
                "Kill of {} reported: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(_) => {}
            Err(e) => warn!("Failed to run kill for {}: {}", self.name, e),
        }

        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

/// Classify a failed runtime command by its stderr.
fn runtime_error(stderr: &[u8]) -> LaunchError {
    let message = String::from_utf8_lossy(stderr).trim().to_string();
    if message.to_ascii_lowercase().contains("permission denied") {
        LaunchError::PermissionDenied(message)
    } else {
        LaunchError::RuntimeUnavailable(message)
    }
}

/// Wait for the client process, killing it once `kill_rx` fires.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    program: String,
) -> RunnerResult<i64> {
    let status = tokio::select! {
        status = child.wait() => status?,
        Ok(()) = kill_rx => {
            let _ = child.start_kill();
            child.wait().await?
        }
    };

    let code = exit_code(status);
    if code == RUNTIME_FAILURE_EXIT_CODE {
        return Err(LaunchError::SpawnFailed(format!(
            "{} run exited with {} before the scan started",
            program, code
        ))
        .into());
    }
    Ok(code)
}

/// Forward lines from a pipe until EOF. Invalid UTF-8 is replaced, not fatal.
async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(LogLine::new(stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read container {}: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => i64::from(code),
        (None, Some(signal)) => 128 + i64::from(signal),
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i64 {
    status.code().map(i64::from).unwrap_or(-1)
}
