//! Run options and the configuration they fold into.
//!
//! A run is described by a list of [`RunOption`] values applied in order to a
//! default [`RunConfiguration`]. Options only set or append, and options that
//! touch different fields commute.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::volumes::{VolumeKind, VolumeSpec};

/// Environment variable passed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `KEY=VALUE`, or `None` when the key is empty.
    pub fn to_env_string(&self) -> Option<String> {
        if self.key.is_empty() {
            None
        } else {
            Some(format!("{}={}", self.key, self.value))
        }
    }
}

impl FromStr for EnvVar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
        }
    }
}

/// Side effect armed by a trigger set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    /// Open the default browser at the URL found in the line
    OpenBrowser,
    /// Fail the run with the line as detail
    FailRun,
}

/// Substrings that arm one action when seen in the engine's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSet {
    pub phrases: Vec<String>,
    pub action: TriggerAction,
}

impl TriggerSet {
    /// Empty phrases are dropped; they would match every line.
    pub fn new(action: TriggerAction, phrases: Vec<String>) -> Self {
        Self {
            phrases: phrases.into_iter().filter(|p| !p.is_empty()).collect(),
            action,
        }
    }

    /// First phrase contained in `line`. Case-sensitive.
    pub fn find_in<'a>(&'a self, line: &str) -> Option<&'a str> {
        self.phrases
            .iter()
            .map(String::as_str)
            .find(|phrase| line.contains(phrase))
    }
}

/// Positional argument for the scanning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineArg {
    Literal(String),
    /// `<flag> <container path>` of an enabled volume, resolved at build time
    VolumePath(VolumeKind),
}

/// A requested feature that could not be enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationWarning {
    pub volume: VolumeKind,
    pub message: String,
}

impl fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} volume disabled: {}", self.volume, self.message)
    }
}

/// One unit of deferred run configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOption {
    LatestImage(bool),
    /// Appended to the engine's positional arguments
    Args(Vec<String>),
    SourceVolume(PathBuf),
    InternalRulesVolume(PathBuf),
    /// Mounts the rules and passes `-er <container path>`; empty path is a no-op
    ExternalRulesVolume(PathBuf),
    UserConfigVolume(PathBuf),
    UserKeyVolume(PathBuf),
    DockerKeyVolume(PathBuf),
    /// Creates the host directory first; on failure the volume stays disabled
    PackageCacheVolume(PathBuf),
    /// Custom container path for a volume kind, used if the volume is enabled
    VolumeMountPoint(VolumeKind, String),
    IgnoreDefaultRules(bool),
    SkipDependencyDownload(bool),
    EnvironmentVariables(Vec<EnvVar>),
    Interrupt,
    AttachedOutput,
    /// Lines containing any phrase open a browser at the URL they carry
    AutoSpawnBrowserOnUrlMessages(Vec<String>),
    /// Lines containing any phrase fail the run
    ExitErrorMessages(Vec<String>),
    /// Attaches output and passes `--debug`
    Debug(bool),
}

impl RunOption {
    /// Apply this option to a configuration.
    pub fn apply(self, config: &mut RunConfiguration) {
        match self {
            Self::LatestImage(pull) => config.pull_latest_image = pull,
            Self::Args(args) => config.push_args(args),
            Self::SourceVolume(path) => {
                config.enable_volume(VolumeKind::SourceCode, &path);
            }
            Self::InternalRulesVolume(path) => {
                config.enable_volume(VolumeKind::InternalRules, &path);
            }
            Self::ExternalRulesVolume(path) => {
                if config.enable_volume(VolumeKind::ExternalRules, &path) {
                    let marker = EngineArg::VolumePath(VolumeKind::ExternalRules);
                    if !config.args.contains(&marker) {
                        config.args.push(marker);
                    }
                }
            }
            Self::UserConfigVolume(path) => {
                config.enable_volume(VolumeKind::UserConfig, &path);
            }
            Self::UserKeyVolume(path) => {
                config.enable_volume(VolumeKind::UserKey, &path);
            }
            Self::DockerKeyVolume(path) => {
                config.enable_volume(VolumeKind::DockerKey, &path);
            }
            Self::PackageCacheVolume(path) => config.enable_package_cache(&path),
            Self::VolumeMountPoint(kind, target) => config.set_mount_point(kind, target),
            Self::IgnoreDefaultRules(ignore) => {
                if ignore {
                    config.push_args(["-i"]);
                }
            }
            Self::SkipDependencyDownload(skip) => {
                if skip {
                    config.push_args(["-sdd"]);
                }
            }
            Self::EnvironmentVariables(vars) => config.environment.extend(vars),
            Self::Interrupt => config.setup_interrupt = true,
            Self::AttachedOutput => config.attach_output = true,
            Self::AutoSpawnBrowserOnUrlMessages(messages) => {
                config.browser_triggers = Some(TriggerSet::new(TriggerAction::OpenBrowser, messages))
            }
            Self::ExitErrorMessages(messages) => {
                config.error_exit_triggers = Some(TriggerSet::new(TriggerAction::FailRun, messages))
            }
            Self::Debug(debug) => {
                if debug {
                    config.attach_output = true;
                    config.push_args(["--debug"]);
                }
            }
        }
    }
}

/// Everything one run needs, built by folding [`RunOption`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfiguration {
    pub pull_latest_image: bool,
    pub args: Vec<EngineArg>,
    /// At most one spec per kind
    pub volumes: Vec<VolumeSpec>,
    pub environment: Vec<EnvVar>,
    pub setup_interrupt: bool,
    pub attach_output: bool,
    pub browser_triggers: Option<TriggerSet>,
    pub error_exit_triggers: Option<TriggerSet>,
    pub warnings: Vec<ConfigurationWarning>,
    /// Custom container paths by kind
    pub mount_points: BTreeMap<VolumeKind, String>,
}

impl RunConfiguration {
    /// Apply options in order to a default configuration.
    pub fn from_options<I>(options: I) -> Self
    where
        I: IntoIterator<Item = RunOption>,
    {
        let mut config = Self::default();
        for option in options {
            option.apply(&mut config);
        }
        config
    }

    /// Spec for a volume kind, if enabled.
    pub fn volume(&self, kind: VolumeKind) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.kind == kind)
    }

    pub fn is_volume_enabled(&self, kind: VolumeKind) -> bool {
        self.volume(kind).is_some()
    }

    /// Literal arguments only, in order. Volume markers are skipped.
    pub fn literal_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                EngineArg::Literal(value) => Some(value.as_str()),
                EngineArg::VolumePath(_) => None,
            })
            .collect()
    }

    fn push_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| EngineArg::Literal(a.into())));
    }

    /// Record an enabled volume. Returns false when the path is unusable.
    fn enable_volume(&mut self, kind: VolumeKind, host_path: &Path) -> bool {
        let Some(resolved) = resolve_host_path(host_path) else {
            debug!("Skipping {} volume: no host path", kind);
            return false;
        };
        let mut spec = VolumeSpec::new(kind, resolved);
        if let Some(target) = self.mount_points.get(&kind) {
            spec = spec.container_path(target.clone());
        }
        match self.volumes.iter_mut().find(|v| v.kind == kind) {
            Some(existing) => *existing = spec,
            None => self.volumes.push(spec),
        }
        true
    }

    fn set_mount_point(&mut self, kind: VolumeKind, target: String) {
        if target.is_empty() {
            debug!("Ignoring empty mount point for {} volume", kind);
            return;
        }
        if let Some(spec) = self.volumes.iter_mut().find(|v| v.kind == kind) {
            spec.container_path = Some(target.clone());
        }
        self.mount_points.insert(kind, target);
    }

    fn enable_package_cache(&mut self, host_path: &Path) {
        let Some(resolved) = resolve_host_path(host_path) else {
            debug!("Skipping package cache volume: no host path");
            return;
        };
        match std::fs::create_dir_all(&resolved) {
            Ok(()) => {
                self.enable_volume(VolumeKind::PackageCache, &resolved);
            }
            Err(e) => {
                warn!(
                    "Could not create package cache volume on host, skipping volume mount: {}",
                    e
                );
                self.warnings.push(ConfigurationWarning {
                    volume: VolumeKind::PackageCache,
                    message: format!("{}: {}", resolved.display(), e),
                });
            }
        }
    }
}

/// Absolute form of a host path, or `None` when empty or unresolvable.
fn resolve_host_path(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    std::path::absolute(path).ok()
}
