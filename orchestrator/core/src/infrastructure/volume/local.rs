// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Local Filesystem Volume
//!
//! Scratch directory `<base>/<tenant>/<run>/<label>-<suffix>` on the container
//! host, bind mounted into the job. Only usable with the local container
//! engine: the directory must be visible to the Docker daemon.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{scope_segments, VolumeState};
use crate::domain::volume::{
    checked_target, IsolatedVolume, MountSource, VolumeError, VolumeFiles, VolumeMount,
    VolumeProvider, VolumeScope,
};

pub struct LocalVolumeProvider {
    base_path: PathBuf,
}

impl LocalVolumeProvider {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl VolumeProvider for LocalVolumeProvider {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn create_volume(&self, scope: VolumeScope) -> Arc<dyn IsolatedVolume> {
        Arc::new(LocalVolume::new(&self.base_path, scope))
    }
}

pub struct LocalVolume {
    scope: VolumeScope,
    dir: PathBuf,
    state: VolumeState<PathBuf>,
}

impl LocalVolume {
    pub fn new(base_path: &Path, scope: VolumeScope) -> Self {
        let (tenant, run) = scope_segments(&scope);
        let dir = base_path.join(tenant).join(run).join(scope.leaf_name());
        Self {
            scope,
            dir,
            state: VolumeState::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn mount_source(dir: &Path) -> MountSource {
        MountSource::HostPath {
            path: dir.to_string_lossy().into_owned(),
        }
    }
}

async fn write_files(dir: &Path, files: &VolumeFiles) -> Result<(), VolumeError> {
    for (rel, content) in files.iter() {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
    }
    Ok(())
}

fn collect_files(dir: &Path) -> Result<VolumeFiles, VolumeError> {
    let mut files = VolumeFiles::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| VolumeError::Backend(format!("failed to walk {}: {}", dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| VolumeError::Backend(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.insert(&rel, std::fs::read(entry.path())?)?;
    }
    Ok(files)
}

#[async_trait]
impl IsolatedVolume for LocalVolume {
    fn scope(&self) -> &VolumeScope {
        &self.scope
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self, files: VolumeFiles) -> Result<MountSource, VolumeError> {
        self.state.ensure_fresh(&self.scope)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        if let Err(e) = write_files(&self.dir, &files).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&self.dir).await {
                warn!(path = %self.dir.display(), error = %cleanup, "Failed to remove partially initialized volume");
            }
            return Err(e);
        }

        self.state.set_ready(self.dir.clone());
        debug!(path = %self.dir.display(), files = files.len(), "Initialized local volume");
        Ok(Self::mount_source(&self.dir))
    }

    fn mount_config(&self, target: &str, read_only: bool) -> Result<VolumeMount, VolumeError> {
        let dir = self.state.require_ready(&self.scope)?;
        Ok(VolumeMount {
            source: Self::mount_source(&dir),
            target: checked_target(target)?,
            read_only,
        })
    }

    async fn read_files(&self) -> Result<Option<VolumeFiles>, VolumeError> {
        let Some(dir) = self.state.ready() else {
            return Ok(None);
        };
        let files = tokio::task::spawn_blocking(move || collect_files(&dir))
            .await
            .map_err(|e| VolumeError::Backend(format!("volume read task failed: {}", e)))??;
        Ok(Some(files))
    }

    async fn write_back(&self, files: &VolumeFiles) -> Result<(), VolumeError> {
        let dir = self.state.require_ready(&self.scope)?;
        write_files(&dir, files).await?;
        debug!(path = %dir.display(), files = files.len(), "Wrote captured files back to local volume");
        Ok(())
    }

    async fn cleanup(&self) {
        let Some(dir) = self.state.release() else {
            return;
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "Removed local volume"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove local volume"),
        }
        // Drop the run directory once its last volume is gone.
        if let Some(run_dir) = dir.parent() {
            if let Err(e) = tokio::fs::remove_dir(run_dir).await {
                debug!(path = %run_dir.display(), error = %e, "Run directory kept");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{RunId, TenantId};
    use tempfile::TempDir;

    fn volume(base: &Path) -> LocalVolume {
        LocalVolume::new(
            base,
            VolumeScope::new(TenantId::new("acme"), RunId::new("run-1"), "input"),
        )
    }

    #[tokio::test]
    async fn test_initialize_and_read_back() {
        let base = TempDir::new().unwrap();
        let vol = volume(base.path());
        let files = VolumeFiles::from_text([("params.json", "{}"), ("nested/a.txt", "a")]).unwrap();

        let source = vol.initialize(files.clone()).await.unwrap();
        match source {
            MountSource::HostPath { path } => assert!(path.contains("acme") && path.contains("run-1")),
            other => panic!("unexpected source {other:?}"),
        }
        assert!(vol.path().join("nested/a.txt").exists());
        assert_eq!(vol.read_files().await.unwrap(), Some(files));
    }

    #[tokio::test]
    async fn test_double_initialize_rejected() {
        let base = TempDir::new().unwrap();
        let vol = volume(base.path());
        vol.initialize(VolumeFiles::new()).await.unwrap();
        assert!(matches!(
            vol.initialize(VolumeFiles::new()).await,
            Err(VolumeError::AlreadyInitialized(_))
        ));
    }

    #[tokio::test]
    async fn test_mount_config_requires_initialize() {
        let base = TempDir::new().unwrap();
        let vol = volume(base.path());
        assert!(matches!(
            vol.mount_config("/data", true),
            Err(VolumeError::NotInitialized(_))
        ));
        vol.initialize(VolumeFiles::new()).await.unwrap();
        let mount = vol.mount_config("/data/", false).unwrap();
        assert_eq!(mount.target, "/data");
        assert!(!mount.read_only);
        assert!(vol.mount_config("relative", true).is_err());
    }

    #[tokio::test]
    async fn test_write_back_overwrites_and_adds() {
        let base = TempDir::new().unwrap();
        let vol = volume(base.path());
        vol.initialize(VolumeFiles::from_text([("a.txt", "old")]).unwrap())
            .await
            .unwrap();
        vol.write_back(&VolumeFiles::from_text([("a.txt", "new"), ("b/c.txt", "c")]).unwrap())
            .await
            .unwrap();

        let files = vol.read_files().await.unwrap().unwrap();
        assert_eq!(files.get_text("a.txt").as_deref(), Some("new"));
        assert_eq!(files.get_text("b/c.txt").as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_safe_before_initialize() {
        let base = TempDir::new().unwrap();
        let untouched = volume(base.path());
        untouched.cleanup().await;

        let vol = volume(base.path());
        vol.initialize(VolumeFiles::from_text([("x", "1")]).unwrap())
            .await
            .unwrap();
        let dir = vol.path().to_path_buf();
        vol.cleanup().await;
        vol.cleanup().await;
        assert!(!dir.exists());
        assert_eq!(vol.read_files().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_directory_removed_with_last_volume() {
        let base = TempDir::new().unwrap();
        let scope = |label: &str| VolumeScope::new(TenantId::new("acme"), RunId::new("run-1"), label);
        let input = LocalVolume::new(base.path(), scope("input"));
        let output = LocalVolume::new(base.path(), scope("output"));
        input.initialize(VolumeFiles::new()).await.unwrap();
        output.initialize(VolumeFiles::new()).await.unwrap();
        let run_dir = input.path().parent().unwrap().to_path_buf();

        input.cleanup().await;
        assert!(run_dir.exists());
        output.cleanup().await;
        assert!(!run_dir.exists());
    }
}
