// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Object-Store Volume (SeaweedFS filer)
//!
//! Content is uploaded under a unique prefix
//! `/<root>/<tenant>/<run>/<label>-<suffix>/` and mounted into the job through
//! a storage-aware driver (Docker volume plugin or CSI driver) that receives
//! the prefix as its `path` option.
//!
//! # API Endpoints
//!
//! - `POST {filer}{path}` (multipart) - upload a file
//! - `POST {filer}{dir}/` - create a directory
//! - `GET {filer}{dir}/` with `Accept: application/json` - list a directory
//! - `GET {filer}{path}` - download a file
//! - `DELETE {filer}{dir}?recursive=true` - remove a prefix

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{scope_segments, VolumeState};
use crate::domain::volume::{
    checked_target, IsolatedVolume, MountSource, VolumeError, VolumeFiles, VolumeMount,
    VolumeProvider, VolumeScope,
};

const LIST_PAGE_SIZE: &str = "1000";
/// `os.ModeDir` as reported in the filer's `Mode` field.
const MODE_DIR: u64 = 1 << 31;

pub struct ObjectStoreVolumeProvider {
    client: Client,
    filer_url: String,
    root: String,
    driver: String,
}

impl ObjectStoreVolumeProvider {
    pub fn new(
        filer_url: impl Into<String>,
        root: impl Into<String>,
        driver: impl Into<String>,
    ) -> Result<Self, VolumeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VolumeError::Backend(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            filer_url: filer_url.into().trim_end_matches('/').to_string(),
            root: root.into().trim_matches('/').to_string(),
            driver: driver.into(),
        })
    }
}

impl VolumeProvider for ObjectStoreVolumeProvider {
    fn backend_name(&self) -> &'static str {
        "object_store"
    }

    fn create_volume(&self, scope: VolumeScope) -> Arc<dyn IsolatedVolume> {
        Arc::new(ObjectStoreVolume::new(
            self.client.clone(),
            &self.filer_url,
            &self.root,
            &self.driver,
            scope,
        ))
    }
}

pub struct ObjectStoreVolume {
    client: Client,
    filer_url: String,
    driver: String,
    prefix: String,
    scope: VolumeScope,
    state: VolumeState<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryListing {
    #[serde(rename = "Entries", default)]
    entries: Option<Vec<DirectoryEntry>>,

    #[serde(rename = "LastFileName", default)]
    last_file_name: String,

    #[serde(rename = "ShouldDisplayLoadMore", default)]
    should_display_load_more: bool,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    #[serde(rename = "FullPath")]
    full_path: String,

    #[serde(rename = "Mode", default)]
    mode: u64,

    #[serde(rename = "IsDirectory", default)]
    is_directory: bool,
}

impl DirectoryEntry {
    fn is_dir(&self) -> bool {
        self.is_directory || self.mode & MODE_DIR != 0
    }
}

async fn status_error(context: String, response: reqwest::Response) -> VolumeError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| format!("HTTP {}", status));
    VolumeError::Backend(format!("{}: {} {}", context, status, body))
}

fn transport_error(e: reqwest::Error) -> VolumeError {
    VolumeError::Backend(format!("filer request failed: {}", e))
}

impl ObjectStoreVolume {
    pub fn new(client: Client, filer_url: &str, root: &str, driver: &str, scope: VolumeScope) -> Self {
        let (tenant, run) = scope_segments(&scope);
        let prefix = if root.is_empty() {
            format!("/{}/{}/{}", tenant, run, scope.leaf_name())
        } else {
            format!("/{}/{}/{}/{}", root, tenant, run, scope.leaf_name())
        };
        Self {
            client,
            filer_url: filer_url.to_string(),
            driver: driver.to_string(),
            prefix,
            scope,
            state: VolumeState::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.filer_url, path)
    }

    fn mount_source(&self) -> MountSource {
        MountSource::ObjectStore {
            driver: self.driver.clone(),
            volume_name: self.scope.resource_name(),
            path: self.prefix.clone(),
        }
    }

    async fn create_dir(&self) -> Result<(), VolumeError> {
        let response = self
            .client
            .post(self.build_url(&format!("{}/", self.prefix)))
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            _ => Err(status_error(format!("failed to create {}", self.prefix), response).await),
        }
    }

    async fn upload(&self, files: &VolumeFiles) -> Result<(), VolumeError> {
        for (rel, content) in files.iter() {
            let path = format!("{}/{}", self.prefix, rel);
            let file_name = rel.rsplit('/').next().unwrap_or(rel).to_string();
            let form = Form::new().part("file", Part::bytes(content.clone()).file_name(file_name));
            let response = self
                .client
                .post(self.build_url(&path))
                .multipart(form)
                .send()
                .await
                .map_err(transport_error)?;
            if !response.status().is_success() {
                return Err(status_error(format!("failed to upload {}", path), response).await);
            }
        }
        Ok(())
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<DirectoryEntry>, VolumeError> {
        let mut entries = Vec::new();
        let mut last = String::new();
        loop {
            let response = self
                .client
                .get(self.build_url(&format!("{}/", dir)))
                .header(ACCEPT, "application/json")
                .query(&[("limit", LIST_PAGE_SIZE), ("lastFileName", last.as_str())])
                .send()
                .await
                .map_err(transport_error)?;
            match response.status() {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => return Ok(entries),
                _ => return Err(status_error(format!("failed to list {}", dir), response).await),
            }
            let page: DirectoryListing = response
                .json()
                .await
                .map_err(|e| VolumeError::Serialization(e.to_string()))?;
            entries.extend(page.entries.unwrap_or_default());
            if !page.should_display_load_more || page.last_file_name.is_empty() {
                return Ok(entries);
            }
            last = page.last_file_name;
        }
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, VolumeError> {
        let response = self
            .client
            .get(self.build_url(path))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(format!("failed to download {}", path), response).await);
        }
        Ok(response.bytes().await.map_err(transport_error)?.to_vec())
    }

    async fn delete_prefix(&self) -> Result<(), VolumeError> {
        let response = self
            .client
            .delete(self.build_url(&self.prefix))
            .query(&[("recursive", "true"), ("ignoreRecursiveError", "true")])
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(format!("failed to delete {}", self.prefix), response).await),
        }
    }
}

#[async_trait]
impl IsolatedVolume for ObjectStoreVolume {
    fn scope(&self) -> &VolumeScope {
        &self.scope
    }

    fn backend_name(&self) -> &'static str {
        "object_store"
    }

    async fn initialize(&self, files: VolumeFiles) -> Result<MountSource, VolumeError> {
        self.state.ensure_fresh(&self.scope)?;

        let outcome = async {
            self.create_dir().await?;
            self.upload(&files).await
        }
        .await;
        if let Err(e) = outcome {
            if let Err(cleanup) = self.delete_prefix().await {
                warn!(prefix = %self.prefix, error = %cleanup, "Failed to remove partially uploaded volume");
            }
            return Err(e);
        }

        self.state.set_ready(self.prefix.clone());
        debug!(prefix = %self.prefix, files = files.len(), "Initialized object-store volume");
        Ok(self.mount_source())
    }

    fn mount_config(&self, target: &str, read_only: bool) -> Result<VolumeMount, VolumeError> {
        self.state.require_ready(&self.scope)?;
        Ok(VolumeMount {
            source: self.mount_source(),
            target: checked_target(target)?,
            read_only,
        })
    }

    async fn read_files(&self) -> Result<Option<VolumeFiles>, VolumeError> {
        if self.state.ready().is_none() {
            return Ok(None);
        }
        let mut files = VolumeFiles::new();
        let mut pending = vec![self.prefix.clone()];
        while let Some(dir) = pending.pop() {
            for entry in self.list_dir(&dir).await? {
                if entry.is_dir() {
                    pending.push(entry.full_path);
                    continue;
                }
                let Some(rel) = entry.full_path.strip_prefix(&format!("{}/", self.prefix)) else {
                    continue;
                };
                let content = self.download(&entry.full_path).await?;
                files.insert(rel, content)?;
            }
        }
        Ok(Some(files))
    }

    async fn write_back(&self, files: &VolumeFiles) -> Result<(), VolumeError> {
        self.state.require_ready(&self.scope)?;
        self.upload(files).await?;
        debug!(prefix = %self.prefix, files = files.len(), "Wrote captured files back to object store");
        Ok(())
    }

    async fn cleanup(&self) {
        if self.state.release().is_none() {
            return;
        }
        match self.delete_prefix().await {
            Ok(()) => debug!(prefix = %self.prefix, "Deleted object-store volume"),
            Err(e) => warn!(prefix = %self.prefix, error = %e, "Failed to delete object-store volume"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::volume::{RunId, TenantId};
    use mockito::Matcher;

    fn volume(url: &str) -> ObjectStoreVolume {
        ObjectStoreVolume::new(
            Client::new(),
            url,
            "secflow",
            "seaweedfs",
            VolumeScope::new(TenantId::new("acme"), RunId::new("run-1"), "data"),
        )
    }

    #[test]
    fn test_prefix_layout() {
        let vol = volume("http://filer:8888");
        assert!(vol.prefix().starts_with("/secflow/acme/run-1/data-"));
        assert_eq!(vol.build_url("/x"), "http://filer:8888/x");
    }

    #[test]
    fn test_directory_detection_from_mode() {
        let entry: DirectoryEntry =
            serde_json::from_str(r#"{"FullPath":"/a/b","Mode":2147484141}"#).unwrap();
        assert!(entry.is_dir());
        let entry: DirectoryEntry = serde_json::from_str(r#"{"FullPath":"/a/c","Mode":420}"#).unwrap();
        assert!(!entry.is_dir());
    }

    #[tokio::test]
    async fn test_initialize_uploads_and_mounts_through_driver() {
        let mut server = mockito::Server::new_async().await;
        let vol = volume(&server.url());
        let mkdir = server
            .mock("POST", format!("{}/", vol.prefix()).as_str())
            .with_status(201)
            .create_async()
            .await;
        let upload = server
            .mock("POST", format!("{}/params.json", vol.prefix()).as_str())
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .with_status(201)
            .create_async()
            .await;

        let source = vol
            .initialize(VolumeFiles::from_text([("params.json", "{}")]).unwrap())
            .await
            .unwrap();
        match source {
            MountSource::ObjectStore { driver, path, .. } => {
                assert_eq!(driver, "seaweedfs");
                assert_eq!(path, vol.prefix());
            }
            other => panic!("unexpected source {other:?}"),
        }
        mkdir.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_upload_removes_prefix() {
        let mut server = mockito::Server::new_async().await;
        let vol = volume(&server.url());
        server
            .mock("POST", format!("{}/", vol.prefix()).as_str())
            .with_status(201)
            .create_async()
            .await;
        server
            .mock("POST", format!("{}/a.txt", vol.prefix()).as_str())
            .with_status(500)
            .with_body("disk full")
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", vol.prefix())
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let err = vol
            .initialize(VolumeFiles::from_text([("a.txt", "a")]).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        delete.assert_async().await;
        // Nothing left to release.
        vol.cleanup().await;
    }

    #[tokio::test]
    #[ignore] // Requires a running SeaweedFS filer on localhost:8888
    async fn integration_test_volume_lifecycle() {
        let vol = volume("http://localhost:8888");
        vol.initialize(VolumeFiles::from_text([("nested/a.txt", "a")]).unwrap())
            .await
            .unwrap();
        let files = vol.read_files().await.unwrap().unwrap();
        assert_eq!(files.get_text("nested/a.txt").as_deref(), Some("a"));
        vol.cleanup().await;
    }
}
