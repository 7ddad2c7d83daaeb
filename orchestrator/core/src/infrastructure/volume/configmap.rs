// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! ConfigMap Volume
//!
//! Content lives in one ConfigMap's `binaryData`. Keys are the URL-safe
//! base64 of each relative path (ConfigMap keys cannot contain `/`), and the
//! mount's `items` project every key back to its path.
//!
//! ConfigMap mounts are read-only in the kubelet, so a writable mount is an
//! `emptyDir` placeholder; whatever the job leaves there comes back through
//! the output capture and is stored with [`IsolatedVolume::write_back`].

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::VolumeState;
use crate::domain::volume::{
    checked_target, IsolatedVolume, KeyPath, MountSource, VolumeError, VolumeFiles, VolumeMount,
    VolumeProvider, VolumeScope,
};
use crate::infrastructure::kubernetes::KubeClient;

/// Total ConfigMap size accepted by the API server.
pub const MAX_CONFIGMAP_BYTES: usize = 1024 * 1024;

pub struct ConfigMapVolumeProvider {
    client: KubeClient,
    namespace: String,
}

impl ConfigMapVolumeProvider {
    pub fn new(client: KubeClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl VolumeProvider for ConfigMapVolumeProvider {
    fn backend_name(&self) -> &'static str {
        "configmap"
    }

    fn create_volume(&self, scope: VolumeScope) -> Arc<dyn IsolatedVolume> {
        Arc::new(ConfigMapVolume::new(self.client.clone(), &self.namespace, scope))
    }
}

pub struct ConfigMapVolume {
    client: KubeClient,
    namespace: String,
    name: String,
    scope: VolumeScope,
    /// Projection of the content written at initialize.
    state: VolumeState<Vec<KeyPath>>,
}

pub fn encode_key(path: &str) -> String {
    URL_SAFE_NO_PAD.encode(path.as_bytes())
}

pub fn decode_key(key: &str) -> Result<String, VolumeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(key)
        .map_err(|e| VolumeError::Serialization(format!("invalid ConfigMap key {}: {}", key, e)))?;
    String::from_utf8(bytes).map_err(|e| VolumeError::Serialization(e.to_string()))
}

/// `binaryData` map and the matching projection items. The limit applies to
/// the encoded keys and values as stored by the API server.
pub fn encode_files(files: &VolumeFiles) -> Result<(Map<String, Value>, Vec<KeyPath>), VolumeError> {
    let mut data = Map::new();
    let mut items = Vec::with_capacity(files.len());
    let mut encoded_bytes = 0;
    for (path, content) in files.iter() {
        let key = encode_key(path);
        let value = STANDARD.encode(content);
        encoded_bytes += key.len() + value.len();
        data.insert(key.clone(), Value::String(value));
        items.push(KeyPath {
            key,
            path: path.clone(),
        });
    }
    if encoded_bytes > MAX_CONFIGMAP_BYTES {
        return Err(VolumeError::Backend(format!(
            "{} bytes of content encode to {} bytes, over the ConfigMap limit of {} bytes",
            files.total_bytes(),
            encoded_bytes,
            MAX_CONFIGMAP_BYTES
        )));
    }
    Ok((data, items))
}

pub fn decode_files(config_map: &Value) -> Result<VolumeFiles, VolumeError> {
    let mut files = VolumeFiles::new();
    if let Some(binary) = config_map["binaryData"].as_object() {
        for (key, value) in binary {
            let content = STANDARD
                .decode(value.as_str().unwrap_or_default())
                .map_err(|e| VolumeError::Serialization(format!("invalid binaryData for {}: {}", key, e)))?;
            files.insert(&decode_key(key)?, content)?;
        }
    }
    if let Some(text) = config_map["data"].as_object() {
        for (key, value) in text {
            files.insert(&decode_key(key)?, value.as_str().unwrap_or_default())?;
        }
    }
    Ok(files)
}

impl ConfigMapVolume {
    pub fn new(client: KubeClient, namespace: &str, scope: VolumeScope) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: scope.resource_name(),
            scope,
            state: VolumeState::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn collection_path(&self) -> String {
        format!("/api/v1/namespaces/{}/configmaps", self.namespace)
    }

    fn object_path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }

    fn manifest(&self, data: Map<String, Value>) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": self.scope.labels(),
            },
            "binaryData": data,
        })
    }
}

#[async_trait]
impl IsolatedVolume for ConfigMapVolume {
    fn scope(&self) -> &VolumeScope {
        &self.scope
    }

    fn backend_name(&self) -> &'static str {
        "configmap"
    }

    async fn initialize(&self, files: VolumeFiles) -> Result<MountSource, VolumeError> {
        self.state.ensure_fresh(&self.scope)?;
        let (data, items) = encode_files(&files)?;
        self.client
            .create(&self.collection_path(), &self.manifest(data))
            .await?;

        self.state.set_ready(items.clone());
        debug!(config_map = %self.name, namespace = %self.namespace, files = files.len(), "Created ConfigMap volume");
        Ok(MountSource::ConfigMap {
            name: self.name.clone(),
            items,
        })
    }

    fn mount_config(&self, target: &str, read_only: bool) -> Result<VolumeMount, VolumeError> {
        let items = self.state.require_ready(&self.scope)?;
        let source = if read_only {
            MountSource::ConfigMap {
                name: self.name.clone(),
                items,
            }
        } else {
            MountSource::EmptyDir
        };
        Ok(VolumeMount {
            source,
            target: checked_target(target)?,
            read_only,
        })
    }

    async fn read_files(&self) -> Result<Option<VolumeFiles>, VolumeError> {
        if self.state.ready().is_none() {
            return Ok(None);
        }
        let config_map: Value = self.client.get(&self.object_path(), &[]).await?;
        decode_files(&config_map).map(Some)
    }

    async fn write_back(&self, files: &VolumeFiles) -> Result<(), VolumeError> {
        self.state.require_ready(&self.scope)?;
        let (data, items) = encode_files(files)?;
        self.client
            .replace(&self.object_path(), &self.manifest(data))
            .await?;
        self.state.set_ready(items);
        debug!(config_map = %self.name, files = files.len(), "Wrote captured files back to ConfigMap");
        Ok(())
    }

    async fn cleanup(&self) {
        if self.state.release().is_none() {
            return;
        }
        match self.client.delete(&self.object_path(), &[]).await {
            Ok(()) => debug!(config_map = %self.name, "Deleted ConfigMap volume"),
            Err(e) => warn!(config_map = %self.name, error = %e, "Failed to delete ConfigMap volume"),
        }
    }
}
