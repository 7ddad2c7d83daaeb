// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Run Specification
//!
//! The declarative, immutable description of one container execution. A
//! `RunSpec` is never mutated after it has been handed to the job runner; the
//! runner derives a backend [`JobRequest`] from it instead.
//!
//! [`JobRequest`]: crate::domain::runtime::JobRequest

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::domain::runtime::RuntimeError;
use crate::domain::volume::{checked_target, MountSource, VolumeMount};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    #[default]
    Bridge,
    Host,
    /// Named user-defined network.
    #[serde(untagged)]
    Custom(String),
}

impl NetworkMode {
    pub fn as_docker_mode(&self) -> &str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
            NetworkMode::Custom(name) => name,
        }
    }
}

/// When the container engine should pull the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "always" => Ok(PullPolicy::Always),
            "ifnotpresent" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(format!(
                "unknown image pull policy '{}' (expected Always, IfNotPresent or Never)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub image: String,

    /// Overrides the image entrypoint when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Mounts declared with the spec. Files written to a writable one are
    /// returned in the run outcome; only host paths and object-store mounts
    /// keep them after the job. Volumes that receive captured files are
    /// attached through the execution context instead.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub network: NetworkMode,

    /// Falls back to the configured default timeout when unset.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// The image has no shell; the output protocol cannot wrap its command.
    #[serde(default)]
    pub distroless: bool,
}

impl RunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: None,
            command: Vec::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            network: NetworkMode::default(),
            timeout: None,
            distroless: false,
        }
    }

    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn distroless(mut self, distroless: bool) -> Self {
        self.distroless = distroless;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RuntimeError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RuntimeError::Configuration(format!("invalid run spec: {}", e)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Configuration(format!("cannot read run spec {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.image.trim().is_empty() {
            return Err(RuntimeError::Configuration(
                "run spec image cannot be empty".to_string(),
            ));
        }
        if matches!(&self.entrypoint, Some(ep) if ep.is_empty()) {
            return Err(RuntimeError::Configuration(
                "run spec entrypoint, when set, cannot be empty".to_string(),
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(RuntimeError::Configuration(
                "run spec timeout must be positive".to_string(),
            ));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(RuntimeError::Configuration(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }

        let mut targets = std::collections::BTreeSet::new();
        for mount in &self.volumes {
            let target = checked_target(&mount.target)
                .map_err(|e| RuntimeError::Configuration(e.to_string()))?;
            if !targets.insert(target.clone()) {
                return Err(RuntimeError::Configuration(format!(
                    "duplicate mount target '{}'",
                    target
                )));
            }
            if !mount.read_only && matches!(mount.source, MountSource::ConfigMap { .. }) {
                return Err(RuntimeError::Configuration(format!(
                    "ConfigMap mount at '{}' must be read-only",
                    target
                )));
            }
        }
        Ok(())
    }
}
