//! Runner settings and well-known container paths.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file and `PRIVSCAN_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::ContainerRuntime;
use crate::error::{RunnerError, RunnerResult};
use crate::volumes::VolumeKind;

/// Default scanning engine image.
pub const DEFAULT_IMAGE: &str = "ghcr.io/privscan/scan-engine:latest";

/// Default time between a graceful stop request and a forced kill.
pub const DEFAULT_STOP_GRACE_PERIOD_SECS: u64 = 10;

/// Environment variable overriding the image reference.
pub const ENV_IMAGE: &str = "PRIVSCAN_IMAGE";
/// Environment variable overriding the container runtime.
pub const ENV_RUNTIME: &str = "PRIVSCAN_RUNTIME";
/// Environment variable pointing at a settings file.
pub const ENV_CONFIG: &str = "PRIVSCAN_CONFIG";

/// Container-side mount points the scanning engine expects.
///
/// Changing any of these breaks the engine's contract unless the image is
/// changed with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerPaths {
    pub source_code: String,
    pub internal_rules: String,
    pub external_rules: String,
    pub user_config: String,
    pub user_key: String,
    pub docker_key: String,
    pub package_cache: String,
}

impl Default for ContainerPaths {
    fn default() -> Self {
        Self {
            source_code: "/app/code".to_string(),
            internal_rules: "/app/rules".to_string(),
            external_rules: "/app/external-rules".to_string(),
            user_config: "/app/config/config.json".to_string(),
            user_key: "/app/keys/user.key".to_string(),
            docker_key: "/app/keys/docker.key".to_string(),
            package_cache: "/root/.m2".to_string(),
        }
    }
}

impl ContainerPaths {
    /// Default container path for a logical volume.
    pub fn for_kind(&self, kind: VolumeKind) -> &str {
        match kind {
            VolumeKind::SourceCode => &self.source_code,
            VolumeKind::InternalRules => &self.internal_rules,
            VolumeKind::ExternalRules => &self.external_rules,
            VolumeKind::UserConfig => &self.user_config,
            VolumeKind::UserKey => &self.user_key,
            VolumeKind::DockerKey => &self.docker_key,
            VolumeKind::PackageCache => &self.package_cache,
        }
    }
}

/// Host-side locations of user credentials and caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    pub user_config_file: Option<PathBuf>,
    pub user_key_file: Option<PathBuf>,
    pub docker_key_file: Option<PathBuf>,
    pub package_cache_dir: Option<PathBuf>,
}

impl Default for HostPaths {
    fn default() -> Self {
        let base = home_dir().map(|home| home.join(".privscan"));
        Self {
            user_config_file: base.as_ref().map(|b| b.join("config.json")),
            user_key_file: base.as_ref().map(|b| b.join("keys").join("user.key")),
            docker_key_file: None,
            package_cache_dir: base.as_ref().map(|b| b.join("packages").join(".m2")),
        }
    }
}

/// Trigger phrases applied to every run unless overridden.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerDefaults {
    /// Lines containing any of these open a browser at the URL in the line
    pub browser: Vec<String>,
    /// Lines containing any of these fail the run
    pub error_exit: Vec<String>,
}

/// Runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Scanning engine image reference
    pub image: String,
    /// Preferred runtime (if not set, auto-detect)
    pub runtime: Option<ContainerRuntime>,
    /// Explicit launcher, e.g. `["sudo", "docker"]`; overrides `runtime`
    pub runtime_command: Vec<String>,
    /// Print commands without executing
    pub dry_run: bool,
    /// Format echoed output for CI logs
    pub ci_mode: bool,
    /// Seconds between a graceful stop and a forced kill
    pub stop_grace_period_secs: u64,
    pub container: ContainerPaths,
    pub host: HostPaths,
    pub triggers: TriggerDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            runtime: None,
            runtime_command: Vec::new(),
            dry_run: false,
            ci_mode: std::env::var("CI").is_ok(),
            stop_grace_period_secs: DEFAULT_STOP_GRACE_PERIOD_SECS,
            container: ContainerPaths::default(),
            host: HostPaths::default(),
            triggers: TriggerDefaults::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file, then apply environment
    /// overrides.
    ///
    /// Without a path, `PRIVSCAN_CONFIG` names the file. A missing file at a
    /// given path is an error; with no path at all the defaults are used.
    pub fn load(path: Option<&Path>) -> RunnerResult<Self> {
        let from_env = std::env::var_os(ENV_CONFIG)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let path = path.or(from_env.as_deref());

        let mut settings = match path {
            Some(path) => {
                debug!("Loading settings from {}", path.display());
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    RunnerError::Settings(format!("{}: {}", path.display(), e))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Parse settings from TOML text. Unset keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> RunnerResult<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `PRIVSCAN_*` overrides from the given lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> RunnerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup(ENV_IMAGE).filter(|v| !v.trim().is_empty()) {
            self.image = image;
        }
        if let Some(runtime) = lookup(ENV_RUNTIME).filter(|v| !v.trim().is_empty()) {
            self.runtime = Some(runtime.parse()?);
        }
        self.validate()
    }

    /// Serialize the effective settings.
    pub fn to_toml(&self) -> RunnerResult<String> {
        toml::to_string_pretty(self).map_err(|e| RunnerError::Settings(e.to_string()))
    }

    /// Grace period as a duration.
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    fn validate(&self) -> RunnerResult<()> {
        if self.image.trim().is_empty() {
            return Err(RunnerError::Settings("image must not be empty".to_string()));
        }
        if self.runtime_command.iter().any(|part| part.trim().is_empty()) {
            return Err(RunnerError::Settings(
                "runtime_command must not contain empty entries".to_string(),
            ));
        }
        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_paths_defaults() {
        let paths = ContainerPaths::default();
        assert_eq!(paths.for_kind(VolumeKind::SourceCode), "/app/code");
        assert_eq!(paths.for_kind(VolumeKind::InternalRules), "/app/rules");
        assert_eq!(paths.for_kind(VolumeKind::ExternalRules), "/app/external-rules");
        assert_eq!(paths.for_kind(VolumeKind::PackageCache), "/root/.m2");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            image = "registry.local/engine:1.2"
            stop_grace_period_secs = 3

            [container]
            source_code = "/src"
            "#,
        )
        .unwrap();

        assert_eq!(settings.image, "registry.local/engine:1.2");
        assert_eq!(settings.stop_grace_period(), Duration::from_secs(3));
        assert_eq!(settings.container.source_code, "/src");
        assert_eq!(settings.container.internal_rules, "/app/rules");
    }

    #[test]
    fn test_runtime_and_triggers_from_toml() {
        let settings = Settings::from_toml_str(
            r#"
            runtime = "podman"

            [triggers]
            browser = ["UI running at"]
            error_exit = ["FATAL:"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.runtime, Some(ContainerRuntime::Podman));
        assert_eq!(settings.triggers.browser, vec!["UI running at"]);
        assert_eq!(settings.triggers.error_exit, vec!["FATAL:"]);
    }

    #[test]
    fn test_empty_image_rejected() {
        let result = Settings::from_toml_str(r#"image = "  ""#);
        assert!(matches!(result, Err(RunnerError::Settings(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| match key {
                ENV_IMAGE => Some("other/image:dev".to_string()),
                ENV_RUNTIME => Some("docker".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(settings.image, "other/image:dev");
        assert_eq!(settings.runtime, Some(ContainerRuntime::Docker));
    }

    #[test]
    fn test_unknown_runtime_override_rejected() {
        let mut settings = Settings::default();
        let result = settings.apply_overrides(|key| {
            (key == ENV_RUNTIME).then(|| "containerd".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_round_trip_through_toml() {
        let settings = Settings {
            runtime_command: vec!["sudo".to_string(), "docker".to_string()],
            ..Settings::default()
        };
        let rendered = settings.to_toml().unwrap();
        let parsed = Settings::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.runtime_command, settings.runtime_command);
        assert_eq!(parsed.container, settings.container);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privscan.toml");
        std::fs::write(&path, "stop_grace_period_secs = 3\n").unwrap();

        let settings = Settings::load(Some(path.as_path())).unwrap();
        assert_eq!(settings.stop_grace_period(), Duration::from_secs(3));

        let missing = Settings::load(Some(dir.path().join("missing.toml").as_path()));
        assert!(matches!(missing, Err(RunnerError::Settings(_))));
    }
}
