// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Runtime Factory - Application Layer
//!
//! Creates the concrete job backend, volume provider and tool registry for
//! the configured deployment mode and wires them into a runner and a group
//! runtime. Platform clients are built here once and injected; nothing is
//! kept in process-wide state.

use std::sync::Arc;

use crate::application::group_runtime::{GroupRuntime, GroupRuntimeConfig};
use crate::application::job_runner::{JobRunner, JobRunnerConfig};
use crate::application::tool_discovery::McpToolDiscovery;
use crate::domain::registry::ToolRegistry;
use crate::domain::runtime::{JobBackend, RuntimeError};
use crate::domain::runtime_config::{
    BackendSettings, ExecutionMode, RuntimeConfigManifest, VolumeBackendConfig,
};
use crate::domain::tool_group::ToolDiscovery;
use crate::domain::volume::VolumeProvider;
use crate::infrastructure::docker::DockerJobBackend;
use crate::infrastructure::kubernetes::{KubeClient, KubeConfig, KubernetesJobBackend};
use crate::infrastructure::registry_client::{BackendRegistryClient, InMemoryToolRegistry};
use crate::infrastructure::volume::{
    ConfigMapVolumeProvider, LocalVolumeProvider, ObjectStoreVolumeProvider,
};

/// Everything needed to execute jobs and provision tool-server groups.
pub struct ExecutionRuntime {
    pub runner: Arc<JobRunner>,
    pub groups: Arc<GroupRuntime>,
}

/// Kubernetes API client for cluster mode, `None` for the local engine.
pub fn create_kube_client(config: &RuntimeConfigManifest) -> Result<Option<KubeClient>, RuntimeError> {
    match config.spec.execution.mode {
        ExecutionMode::Docker => Ok(None),
        ExecutionMode::Kubernetes => {
            let kube_config = KubeConfig::in_cluster(&config.spec.kubernetes)?;
            Ok(Some(KubeClient::new(kube_config)?))
        }
    }
}

/// Creates a JobBackend implementation based on the configured execution mode
pub fn create_job_backend(
    config: &RuntimeConfigManifest,
    kube: Option<&KubeClient>,
) -> Result<Arc<dyn JobBackend>, RuntimeError> {
    match config.spec.execution.mode {
        ExecutionMode::Docker => {
            let docker = &config.spec.docker;
            Ok(Arc::new(DockerJobBackend::new(
                docker.socket_path.as_deref(),
                docker.service_host.clone(),
            )?))
        }
        ExecutionMode::Kubernetes => {
            let client = kube.cloned().ok_or_else(|| {
                RuntimeError::Configuration("kubernetes mode requires a cluster client".to_string())
            })?;
            let k8s = &config.spec.kubernetes;
            Ok(Arc::new(KubernetesJobBackend::new(
                client,
                k8s.namespace.clone(),
                k8s.job_ttl_seconds,
            )))
        }
    }
}

/// Creates a VolumeProvider implementation based on the configured backend
pub fn create_volume_provider(
    config: &RuntimeConfigManifest,
    kube: Option<&KubeClient>,
) -> Result<Arc<dyn VolumeProvider>, RuntimeError> {
    match &config.spec.volumes {
        VolumeBackendConfig::Local { base_path } => {
            if config.spec.execution.mode == ExecutionMode::Kubernetes {
                return Err(RuntimeError::Configuration(
                    "local volumes cannot be mounted by cluster jobs".to_string(),
                ));
            }
            Ok(Arc::new(LocalVolumeProvider::new(base_path.clone())))
        }
        VolumeBackendConfig::ConfigMap => {
            let client = kube.cloned().ok_or_else(|| {
                RuntimeError::Configuration(
                    "config_map volumes require the kubernetes execution mode".to_string(),
                )
            })?;
            Ok(Arc::new(ConfigMapVolumeProvider::new(
                client,
                config.spec.kubernetes.namespace.clone(),
            )))
        }
        VolumeBackendConfig::ObjectStore {
            filer_url,
            root,
            driver,
        } => Ok(Arc::new(ObjectStoreVolumeProvider::new(
            filer_url.clone(),
            root.clone(),
            driver.clone(),
        )?)),
    }
}

/// Backend registry client, or an in-process registry when no backend URL
/// is configured.
pub fn create_tool_registry(settings: &BackendSettings) -> Result<Arc<dyn ToolRegistry>, RuntimeError> {
    match &settings.base_url {
        Some(url) => Ok(Arc::new(BackendRegistryClient::new(
            url.clone(),
            settings.internal_token.clone(),
        )?)),
        None => {
            tracing::warn!("No backend URL configured; tool registrations stay in process");
            Ok(Arc::new(InMemoryToolRegistry::new()))
        }
    }
}

/// Build the runner and group runtime for a validated configuration.
pub fn build_execution_runtime(config: &RuntimeConfigManifest) -> Result<ExecutionRuntime, RuntimeError> {
    config
        .validate()
        .map_err(|e| RuntimeError::Configuration(e.to_string()))?;

    let kube = create_kube_client(config)?;
    let backend = create_job_backend(config, kube.as_ref())?;
    let volumes = create_volume_provider(config, kube.as_ref())?;
    let registry = create_tool_registry(&config.spec.backend)?;
    let discovery: Arc<dyn ToolDiscovery> = Arc::new(McpToolDiscovery::from_settings(&config.spec.discovery));

    tracing::info!(
        mode = ?config.spec.execution.mode,
        backend = backend.name(),
        volumes = volumes.backend_name(),
        "Execution runtime configured"
    );

    let runner = Arc::new(JobRunner::new(
        backend,
        volumes,
        JobRunnerConfig::from(&config.spec.execution),
    ));
    let groups = Arc::new(GroupRuntime::new(
        runner.clone(),
        discovery,
        registry,
        GroupRuntimeConfig::from(&config.spec.groups),
    ));
    Ok(ExecutionRuntime { runner, groups })
}
