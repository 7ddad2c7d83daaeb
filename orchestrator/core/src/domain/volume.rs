// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Isolated Volume
//!
//! Ephemeral per-run storage that backs a container mount. Content is a flat
//! map of volume-relative path to bytes; the backing store (host directory,
//! cluster config object, object storage) is hidden behind [`IsolatedVolume`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Volume value objects and the backend-agnostic volume seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::naming::{self, LABEL_PURPOSE};
use crate::domain::path_sanitizer::{PathSanitizer, PathSanitizerError};

// ============================================================================
// Value Objects
// ============================================================================

/// Identifier of the tenant that owns a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Tenant used by single-tenant deployments and the CLI.
    pub fn default_tenant() -> Self {
        Self("default".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Addressing for one volume: tenant, run, purpose label and a random suffix.
///
/// The suffix is drawn once at construction, so two scopes built for the same
/// run and label never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeScope {
    pub tenant: TenantId,
    pub run_id: RunId,
    pub label: String,
    pub suffix: String,
}

impl VolumeScope {
    pub fn new(tenant: TenantId, run_id: RunId, label: impl Into<String>) -> Self {
        Self {
            tenant,
            run_id,
            label: label.into(),
            suffix: naming::random_suffix(8),
        }
    }

    /// Flat DNS-safe name `sfv-<run>-<label>-<suffix>` for cluster objects.
    pub fn resource_name(&self) -> String {
        naming::resource_name("sfv", &[self.run_id.as_str(), &self.label], &self.suffix)
    }

    /// Directory/prefix segment below `<tenant>/<run>/`.
    pub fn leaf_name(&self) -> String {
        let label = naming::sanitize_dns_label(&self.label, 40);
        if label.is_empty() {
            self.suffix.clone()
        } else {
            format!("{}-{}", label, self.suffix)
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = naming::resource_labels(&self.tenant, &self.run_id);
        labels.insert(LABEL_PURPOSE.to_string(), naming::label_value(&self.label));
        labels
    }
}

/// Relative path to content. Keys are always sanitized relative paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFiles(BTreeMap<String, Vec<u8>>);

impl VolumeFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, normalizing the path. Rejects traversal and absolute paths.
    pub fn insert(
        &mut self,
        path: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), VolumeError> {
        let path = PathSanitizer::new().relative(path)?;
        self.0.insert(path, content.into());
        Ok(())
    }

    pub fn from_text<'a, I>(entries: I) -> Result<Self, VolumeError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut files = Self::new();
        for (path, content) in entries {
            files.insert(path, content.as_bytes())?;
        }
        Ok(files)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.0.get(path).map(Vec::as_slice)
    }

    pub fn get_text(&self, path: &str) -> Option<String> {
        self.get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

impl IntoIterator for VolumeFiles {
    type Item = (String, Vec<u8>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One `key -> path` projection of a config object into a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPath {
    pub key: String,
    pub path: String,
}

/// Backend-specific description of what gets mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountSource {
    /// Directory on the container host (bind mount).
    HostPath { path: String },
    /// Cluster config object projected through `items`.
    ConfigMap { name: String, items: Vec<KeyPath> },
    /// Empty scratch space (tmpfs / emptyDir).
    EmptyDir,
    /// Object-storage prefix reached through a storage-aware mount driver.
    ObjectStore {
        driver: String,
        volume_name: String,
        path: String,
    },
}

impl MountSource {
    pub fn kind(&self) -> &'static str {
        match self {
            MountSource::HostPath { .. } => "host_path",
            MountSource::ConfigMap { .. } => "config_map",
            MountSource::EmptyDir => "empty_dir",
            MountSource::ObjectStore { .. } => "object_store",
        }
    }
}

/// A mount as declared on a run spec or produced by a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: MountSource,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Invalid volume path: {0}")]
    InvalidPath(#[from] PathSanitizerError),

    #[error("Volume {0} has not been initialized")]
    NotInitialized(String),

    #[error("Volume {0} is already initialized")]
    AlreadyInitialized(String),

    #[error("{backend} volumes cannot be mounted here: {reason}")]
    UnsupportedMount { backend: String, reason: String },

    #[error("Volume I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Volume backend error: {0}")]
    Backend(String),

    #[error("Volume serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Volume seam
// ============================================================================

/// One ephemeral volume.
///
/// Lifecycle: `initialize` once, any number of `mount_config` calls, then
/// `read_files`/`write_back` after the job ran, then `cleanup`.
///
/// `cleanup` must be idempotent, must be safe after a failed or missing
/// `initialize`, and never returns an error: failures are logged.
#[async_trait]
pub trait IsolatedVolume: Send + Sync {
    fn scope(&self) -> &VolumeScope;

    /// Short backend name for logs and error messages.
    fn backend_name(&self) -> &'static str;

    async fn initialize(&self, files: VolumeFiles) -> Result<MountSource, VolumeError>;

    fn mount_config(&self, target: &str, read_only: bool) -> Result<VolumeMount, VolumeError>;

    async fn read_files(&self) -> Result<Option<VolumeFiles>, VolumeError>;

    async fn write_back(&self, files: &VolumeFiles) -> Result<(), VolumeError>;

    async fn cleanup(&self);
}

/// Creates volumes for one deployment mode.
pub trait VolumeProvider: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn create_volume(&self, scope: VolumeScope) -> Arc<dyn IsolatedVolume>;
}

/// Validates a mount target and returns it in canonical form.
pub(crate) fn checked_target(target: &str) -> Result<String, VolumeError> {
    Ok(PathSanitizer::new().mount_target(target)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_files_sanitizes_paths() {
        let mut files = VolumeFiles::new();
        files.insert("./a//b.txt", "x").unwrap();
        assert_eq!(files.get_text("a/b.txt").as_deref(), Some("x"));
        assert!(files.insert("../escape", "x").is_err());
        assert!(files.insert("/abs", "x").is_err());
    }

    #[test]
    fn test_scope_names_are_unique_per_instance() {
        let a = VolumeScope::new(TenantId::default(), RunId::new("r1"), "input");
        let b = VolumeScope::new(TenantId::default(), RunId::new("r1"), "input");
        assert_ne!(a.resource_name(), b.resource_name());
        assert_ne!(a.leaf_name(), b.leaf_name());
        assert!(a.resource_name().len() <= naming::MAX_LABEL_LEN);
        assert!(a.leaf_name().starts_with("input-"));
    }

    #[test]
    fn test_scope_labels() {
        let scope = VolumeScope::new(TenantId::new("t1"), RunId::new("r1"), "credentials");
        let labels = scope.labels();
        assert_eq!(labels[naming::LABEL_MANAGED], "true");
        assert_eq!(labels[naming::LABEL_TENANT], "t1");
        assert_eq!(labels[naming::LABEL_RUN_ID], "r1");
        assert_eq!(labels[LABEL_PURPOSE], "credentials");
    }

    #[test]
    fn test_mount_source_serde_tag() {
        let source = MountSource::HostPath { path: "/tmp/x".into() };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "host_path");
        let back: MountSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
    }
}
