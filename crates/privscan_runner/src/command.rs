//! Assembly of the concrete container invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ContainerPaths;
use crate::options::{EngineArg, RunConfiguration, TriggerSet};
use crate::volumes::{MountArg, VolumeResolver};

/// Prefix for generated container names.
pub const CONTAINER_NAME_PREFIX: &str = "privscan";

/// Everything the container engine needs to start the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Image reference
    pub image: String,
    /// Pull the image before running
    pub pull_latest_image: bool,
    /// Container name prefix
    pub name_prefix: String,
    /// Bind mounts, in enablement order
    pub mounts: Vec<MountArg>,
    /// `KEY=VALUE` strings, in insertion order
    pub env: Vec<String>,
    /// Positional arguments for the scanning engine
    pub args: Vec<String>,
}

/// How the supervisor should treat a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionPlan {
    pub attach_output: bool,
    pub interrupt_enabled: bool,
    pub browser_triggers: Option<TriggerSet>,
    pub error_exit_triggers: Option<TriggerSet>,
    pub stop_grace_period: Duration,
}

impl SupervisionPlan {
    pub fn from_config(config: &RunConfiguration, stop_grace_period: Duration) -> Self {
        Self {
            attach_output: config.attach_output,
            interrupt_enabled: config.setup_interrupt,
            browser_triggers: config.browser_triggers.clone(),
            error_exit_triggers: config.error_exit_triggers.clone(),
            stop_grace_period,
        }
    }

    /// Whether any trigger set is armed.
    pub fn has_triggers(&self) -> bool {
        self.browser_triggers.is_some() || self.error_exit_triggers.is_some()
    }
}

/// Builds a [`ProcessSpec`] from a [`RunConfiguration`].
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    resolver: VolumeResolver,
}

impl CommandBuilder {
    pub fn new(paths: ContainerPaths) -> Self {
        Self {
            resolver: VolumeResolver::new(paths),
        }
    }

    /// Deterministically build the invocation for `image`.
    pub fn build(&self, image: &str, config: &RunConfiguration) -> ProcessSpec {
        ProcessSpec {
            image: image.to_string(),
            pull_latest_image: config.pull_latest_image,
            name_prefix: CONTAINER_NAME_PREFIX.to_string(),
            mounts: self.resolver.resolve(&config.volumes),
            env: config
                .environment
                .iter()
                .filter_map(|var| var.to_env_string())
                .collect(),
            args: self.materialize_args(config),
        }
    }

    fn materialize_args(&self, config: &RunConfiguration) -> Vec<String> {
        let mut args = Vec::with_capacity(config.args.len());
        for arg in &config.args {
            match arg {
                EngineArg::Literal(value) => args.push(value.clone()),
                EngineArg::VolumePath(kind) => {
                    let spec = config
                        .volume(*kind)
                        .filter(|spec| !spec.host_path.as_os_str().is_empty());
                    if let (Some(spec), Some(flag)) = (spec, kind.path_flag()) {
                        args.push(flag.to_string());
                        args.push(self.resolver.container_path(spec));
                    }
                }
            }
        }
        args
    }
}
