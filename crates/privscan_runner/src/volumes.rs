//! Logical volumes and their resolution into bind mounts.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ContainerPaths;

/// Logical volumes the scanning engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    SourceCode,
    InternalRules,
    ExternalRules,
    UserConfig,
    UserKey,
    DockerKey,
    PackageCache,
}

impl VolumeKind {
    /// Engine flag that must accompany this volume's container path, if any.
    pub fn path_flag(&self) -> Option<&'static str> {
        match self {
            Self::ExternalRules => Some("-er"),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceCode => "source code",
            Self::InternalRules => "internal rules",
            Self::ExternalRules => "external rules",
            Self::UserConfig => "user config",
            Self::UserKey => "user key",
            Self::DockerKey => "docker key",
            Self::PackageCache => "package cache",
        };
        f.write_str(name)
    }
}

/// An enabled volume: a resolved host path plus an optional container path.
///
/// Disabled volumes are never represented; options that cannot resolve a
/// host path simply do not create a spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub kind: VolumeKind,
    pub host_path: PathBuf,
    /// Overrides the engine's default mount point for the kind
    pub container_path: Option<String>,
}

impl VolumeSpec {
    pub fn new(kind: VolumeKind, host_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            host_path: host_path.into(),
            container_path: None,
        }
    }

    pub fn container_path(mut self, path: impl Into<String>) -> Self {
        self.container_path = Some(path.into());
        self
    }
}

/// A concrete bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArg {
    pub kind: VolumeKind,
    /// Host path to mount
    pub source: PathBuf,
    /// Container path to mount to
    pub target: String,
}

impl MountArg {
    /// `host:container` form used by `-v`.
    pub fn bind_spec(&self) -> String {
        format!("{}:{}", self.source.to_string_lossy(), self.target)
    }
}

/// Maps volume specs onto bind mounts using the engine's default paths.
#[derive(Debug, Clone, Default)]
pub struct VolumeResolver {
    paths: ContainerPaths,
}

impl VolumeResolver {
    pub fn new(paths: ContainerPaths) -> Self {
        Self { paths }
    }

    /// Container path a spec resolves to.
    pub fn container_path(&self, spec: &VolumeSpec) -> String {
        spec.container_path
            .clone()
            .unwrap_or_else(|| self.paths.for_kind(spec.kind).to_string())
    }

    /// Resolve specs into mounts, preserving order. Specs with an empty host
    /// path emit nothing.
    pub fn resolve(&self, volumes: &[VolumeSpec]) -> Vec<MountArg> {
        volumes
            .iter()
            .filter(|spec| !spec.host_path.as_os_str().is_empty())
            .map(|spec| MountArg {
                kind: spec.kind,
                source: spec.host_path.clone(),
                target: self.container_path(spec),
            })
            .collect()
    }
}
