//! Container engine trait and shared types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::command::{ProcessSpec, SupervisionPlan};
use crate::error::RunnerResult;

/// Capacity of the output channel between the container and the matcher.
///
/// Readers wait when it is full, so lines are delayed rather than dropped.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of container output.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

impl LogLine {
    pub fn new(stream: LogStream, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            message: message.into(),
        }
    }

    pub fn stdout(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stdout, message)
    }

    pub fn stderr(message: impl Into<String>) -> Self {
        Self::new(LogStream::Stderr, message)
    }
}

/// Merged stdout/stderr of a running container, in emission order.
pub type OutputReceiver = mpsc::Receiver<LogLine>;

/// Stop and kill handles for a running container.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Ask the container to stop, giving it `grace` before the runtime kills it.
    async fn stop(&self, grace: Duration) -> RunnerResult<()>;

    /// Terminate the container immediately.
    async fn kill(&self) -> RunnerResult<()>;
}

/// A started container.
pub struct SpawnedContainer {
    pub name: String,
    pub control: Arc<dyn ContainerControl>,
    /// Present only when output was attached
    pub output: Option<OutputReceiver>,
    /// Resolves to the exit code once the container is gone
    pub exit: BoxFuture<'static, RunnerResult<i64>>,
}

impl std::fmt::Debug for SpawnedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedContainer")
            .field("name", &self.name)
            .field("attached", &self.output.is_some())
            .finish()
    }
}

/// How a container is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Pipe the container's output back to the caller
    pub attach: bool,
    /// The caller handles host interrupts and stops the container itself.
    /// When false, the runtime client stays in the caller's process group
    /// so a terminal Ctrl+C reaches it directly.
    pub owns_interrupts: bool,
}

impl SpawnOptions {
    pub fn from_plan(plan: &SupervisionPlan) -> Self {
        Self {
            attach: plan.attach_output,
            owns_interrupts: plan.interrupt_enabled,
        }
    }
}

/// A way of running containers.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short name for logs, e.g. `docker`.
    fn name(&self) -> String;

    /// Engine version information. Fails when the engine cannot be reached.
    async fn version(&self) -> RunnerResult<String>;

    /// Check if an image exists locally.
    async fn image_exists(&self, image: &str) -> RunnerResult<bool>;

    /// Pull an image.
    async fn pull_image(&self, image: &str) -> RunnerResult<()>;

    /// Start a container. Failures here are launch errors.
    async fn spawn(
        &self,
        spec: &ProcessSpec,
        options: SpawnOptions,
    ) -> RunnerResult<SpawnedContainer>;
}

/// `<prefix>-<8 hex chars>`.
pub fn generate_container_name(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_format() {
        let name = generate_container_name("privscan");
        assert!(name.starts_with("privscan-"));
        assert_eq!(name.len(), "privscan-".len() + 8);
        assert_ne!(name, generate_container_name("privscan"));
    }
}
