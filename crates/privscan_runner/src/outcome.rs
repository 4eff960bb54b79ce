//! Terminal result of a supervised run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::options::ConfigurationWarning;

/// Why a run that started counts as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeFailure {
    /// The engine exited with a non-zero status
    NonZeroExit { exit_code: i64 },
    /// An error-exit trigger matched; takes precedence over the exit code
    TriggerMatched { line: String, exit_code: i64 },
}

impl RuntimeFailure {
    pub fn exit_code(&self) -> i64 {
        match self {
            Self::NonZeroExit { exit_code } | Self::TriggerMatched { exit_code, .. } => *exit_code,
        }
    }
}

impl std::fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonZeroExit { exit_code } => {
                write!(f, "scanning engine exited with code {}", exit_code)
            }
            Self::TriggerMatched { line, .. } => write!(f, "scanning engine reported: {}", line),
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed(RuntimeFailure),
    /// Stopped by a host interrupt; not an engine failure
    Interrupted,
}

/// Result of one container run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Generated container name
    pub container_name: String,
    /// Exit code, when the container exit was observed
    pub exit_code: Option<i64>,
    pub status: RunStatus,
    /// URL a browser was opened at
    pub browser_url: Option<String>,
    /// Features that could not be enabled
    pub warnings: Vec<ConfigurationWarning>,
    /// Execution start time
    pub started_at: DateTime<Utc>,
    /// Execution end time
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Check if the run succeeded.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn is_interrupted(&self) -> bool {
        self.status == RunStatus::Interrupted
    }

    pub fn failure(&self) -> Option<&RuntimeFailure> {
        match &self.status {
            RunStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: RunStatus) -> RunOutcome {
        let now = Utc::now();
        RunOutcome {
            container_name: "privscan-test".to_string(),
            exit_code: Some(0),
            status,
            browser_url: None,
            warnings: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_status_helpers() {
        assert!(outcome(RunStatus::Succeeded).success());
        assert!(outcome(RunStatus::Interrupted).is_interrupted());

        let failed = outcome(RunStatus::Failed(RuntimeFailure::TriggerMatched {
            line: "FATAL: rule parse error".to_string(),
            exit_code: 0,
        }));
        assert!(!failed.success());
        assert_eq!(failed.failure().unwrap().exit_code(), 0);
        assert_eq!(
            failed.failure().unwrap().to_string(),
            "scanning engine reported: FATAL: rule parse error"
        );
    }

    #[test]
    fn test_outcome_serializes() {
        let json = serde_json::to_value(outcome(RunStatus::Failed(
            RuntimeFailure::NonZeroExit { exit_code: 2 },
        )))
        .unwrap();
        assert_eq!(json["status"]["failed"]["non_zero_exit"]["exit_code"], 2);
    }
}
