//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Reasons a container could not be started at all.
///
/// These are fatal to the run and never retried. A container that starts and
/// then exits non-zero is reported through [`crate::RunOutcome`] instead.
#[derive(Error, Debug, Clone)]
pub enum LaunchError {
    #[error("Container runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Image not found locally and pull disabled: {0}")]
    ImageNotFound(String),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to spawn container: {0}")]
    SpawnFailed(String),
}

impl LaunchError {
    /// Classify a spawn-time IO error.
    pub fn from_spawn_io(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                Self::RuntimeUnavailable(format!("{}: {}", program, err))
            }
            std::io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{}: {}", program, err))
            }
            _ => Self::SpawnFailed(format!("{}: {}", program, err)),
        }
    }
}

/// Errors that can occur during runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Container supervision failed: {0}")]
    Supervision(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RunnerError {
    /// Whether this error means the container never started.
    pub fn is_launch_error(&self) -> bool {
        matches!(self, Self::Launch(_))
    }
}
