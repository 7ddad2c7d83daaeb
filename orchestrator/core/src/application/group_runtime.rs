// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Group Runtime
//!
//! Provisions the enabled sibling servers of a tool-server group as stay-up
//! containers sharing one credential, discovers their tools and registers
//! every server with the backend's tool registry.
//!
//! Lifecycle of one group instance:
//!
//! 1. map the credential to env (and optionally to files in one shared,
//!    read-only credential volume)
//! 2. start the siblings with bounded concurrency
//! 3. issue one registration token for all sibling node ids
//! 4. discover and register each sibling; failures here only skip that sibling
//!
//! A failure in steps 1-3 tears down whatever was already started.

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::job_runner::{JobRunner, ServiceHandle};
use crate::domain::credentials::{map_to_env, map_to_files};
use crate::domain::registry::{group_node_id, ToolRegistration, ToolRegistry, TRANSPORT_HTTP};
use crate::domain::run_spec::{NetworkMode, RunSpec};
use crate::domain::runtime::{ExecutionContext, RuntimeError};
use crate::domain::runtime_config::GroupSettings;
use crate::domain::tool_group::{GroupTemplate, ServerDescriptor, ServerEndpoint, ToolDiscovery};
use crate::domain::volume::{IsolatedVolume, RunId, TenantId, VolumeScope};

pub const MCP_COMMAND_ENV: &str = "SECFLOW_MCP_COMMAND";
pub const MCP_ARGS_ENV: &str = "SECFLOW_MCP_ARGS";
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone)]
pub struct GroupRuntimeConfig {
    /// Where the shared credential volume is mounted in every sibling.
    pub credential_mount: String,
    /// Path of the MCP endpoint on each server.
    pub endpoint_path: String,
    pub service_port: u16,
    pub max_parallel: usize,
}

impl Default for GroupRuntimeConfig {
    fn default() -> Self {
        Self::from(&GroupSettings::default())
    }
}

impl From<&GroupSettings> for GroupRuntimeConfig {
    fn from(settings: &GroupSettings) -> Self {
        Self {
            credential_mount: "/secflow/credentials".to_string(),
            endpoint_path: "/mcp".to_string(),
            service_port: settings.service_port,
            max_parallel: settings.max_parallel.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub tenant: TenantId,
    pub run_id: RunId,
    /// Workflow node id of the group; siblings register as `<id>/<serverId>`.
    pub group_instance_id: String,
    /// Decrypted credential document.
    pub credential: Value,
    pub enabled_server_ids: Vec<String>,
    pub template: GroupTemplate,
}

pub struct GroupRuntime {
    runner: Arc<JobRunner>,
    discovery: Arc<dyn ToolDiscovery>,
    registry: Arc<dyn ToolRegistry>,
    config: GroupRuntimeConfig,
    credential_volumes: DashMap<String, Arc<dyn IsolatedVolume>>,
}

fn group_key(run_id: &RunId, group_instance_id: &str) -> String {
    format!("{}/{}", run_id, group_instance_id)
}

fn credential_is_empty(credential: &Value) -> bool {
    match credential {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl GroupRuntime {
    pub fn new(
        runner: Arc<JobRunner>,
        discovery: Arc<dyn ToolDiscovery>,
        registry: Arc<dyn ToolRegistry>,
        config: GroupRuntimeConfig,
    ) -> Self {
        Self {
            runner,
            discovery,
            registry,
            config,
            credential_volumes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GroupRuntimeConfig {
        &self.config
    }

    /// Start, discover and register the enabled servers of one group.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<Vec<ServerEndpoint>, RuntimeError> {
        if credential_is_empty(&request.credential) {
            return Err(RuntimeError::Configuration(format!(
                "credential for group '{}' is empty",
                request.group_instance_id
            )));
        }
        request.template.validate()?;

        if request.enabled_server_ids.is_empty() {
            info!(group = %request.group_instance_id, "No servers enabled; nothing to provision");
            return Ok(Vec::new());
        }
        let servers = request.template.select(&request.enabled_server_ids)?;

        let mut env = map_to_env(&request.credential, &request.template.credential_mapping)?;
        let credential_volume = self.prepare_credential_volume(request, &mut env).await?;

        info!(
            group = %request.group_instance_id,
            template = %request.template.slug,
            run_id = %request.run_id,
            servers = servers.len(),
            "Provisioning tool-server group"
        );

        let results: Vec<Result<ServerEndpoint, RuntimeError>> = stream::iter(
            servers
                .iter()
                .map(|server| self.start_server(request, server, &env, credential_volume.as_ref())),
        )
        .buffered(self.config.max_parallel)
        .collect()
        .await;

        let mut endpoints = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    error!(group = %request.group_instance_id, error = %e, "Failed to start tool server");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.teardown(&request.run_id, &request.group_instance_id, &endpoints)
                .await;
            return Err(e);
        }

        let node_ids: Vec<String> = endpoints
            .iter()
            .map(|ep| group_node_id(&request.group_instance_id, &ep.server_id))
            .collect();
        let token = match self
            .registry
            .issue_token(request.run_id.as_str(), &node_ids)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                error!(group = %request.group_instance_id, error = %e, "Failed to issue registration token");
                self.teardown(&request.run_id, &request.group_instance_id, &endpoints)
                    .await;
                return Err(e);
            }
        };

        stream::iter(endpoints.iter())
            .for_each_concurrent(self.config.max_parallel, |endpoint| {
                self.register_server(request, endpoint, &token)
            })
            .await;

        info!(group = %request.group_instance_id, servers = endpoints.len(), "Tool-server group ready");
        Ok(endpoints)
    }

    /// Stop every container-backed sibling and drop the shared credential
    /// volume. Failures are logged.
    pub async fn teardown(&self, run_id: &RunId, group_instance_id: &str, endpoints: &[ServerEndpoint]) {
        let handles: Vec<ServiceHandle> = endpoints
            .iter()
            .filter_map(|ep| {
                ep.job_name.clone().map(|job_name| ServiceHandle {
                    job_name,
                    container_id: ep.container_id.clone(),
                    endpoint: ep.endpoint.clone(),
                })
            })
            .collect();

        stream::iter(handles.iter())
            .for_each_concurrent(self.config.max_parallel, |handle| self.runner.stop_service(handle))
            .await;

        if let Some((_, volume)) = self
            .credential_volumes
            .remove(&group_key(run_id, group_instance_id))
        {
            volume.cleanup().await;
        }
        info!(group = %group_instance_id, run_id = %run_id, stopped = handles.len(), "Tore down tool-server group");
    }

    async fn prepare_credential_volume(
        &self,
        request: &ProvisionRequest,
        env: &mut std::collections::BTreeMap<String, String>,
    ) -> Result<Option<Arc<dyn IsolatedVolume>>, RuntimeError> {
        if !request.template.credential_files {
            return Ok(None);
        }
        let Some(files) = map_to_files(&request.credential)? else {
            warn!(
                group = %request.group_instance_id,
                template = %request.template.slug,
                "Credential has no file representation; using environment only"
            );
            return Ok(None);
        };

        let volume = self.runner.volume_provider().create_volume(VolumeScope::new(
            request.tenant.clone(),
            request.run_id.clone(),
            "credentials",
        ));
        if let Err(e) = volume.initialize(files.files.clone()).await {
            volume.cleanup().await;
            return Err(e.into());
        }
        env.extend(files.env(&self.config.credential_mount));

        let key = group_key(&request.run_id, &request.group_instance_id);
        if let Some(stale) = self.credential_volumes.insert(key, volume.clone()) {
            warn!(group = %request.group_instance_id, "Replacing credential volume of a group that was never torn down");
            stale.cleanup().await;
        }
        Ok(Some(volume))
    }

    async fn start_server(
        &self,
        request: &ProvisionRequest,
        server: &ServerDescriptor,
        group_env: &std::collections::BTreeMap<String, String>,
        credential_volume: Option<&Arc<dyn IsolatedVolume>>,
    ) -> Result<ServerEndpoint, RuntimeError> {
        if let Some(endpoint) = &server.endpoint {
            info!(server = %server.id, endpoint = %endpoint, "Using direct tool-server endpoint");
            return Ok(ServerEndpoint {
                server_id: server.id.clone(),
                server_name: server.name.clone(),
                endpoint: endpoint.clone(),
                container_id: String::new(),
                job_name: None,
            });
        }

        let args = serde_json::to_string(&server.args)
            .map_err(|e| RuntimeError::Configuration(format!("invalid args for server {}: {}", server.id, e)))?;
        let mut spec = RunSpec::new(request.template.image_for(server)).with_network(NetworkMode::Bridge);
        spec.env = group_env.clone();
        spec = spec
            .with_env(MCP_COMMAND_ENV, &server.command)
            .with_env(MCP_ARGS_ENV, args)
            .with_env(PORT_ENV, self.config.service_port.to_string());

        let mut ctx = ExecutionContext::new(
            request.tenant.clone(),
            request.run_id.clone(),
            group_node_id(&request.group_instance_id, &server.id),
        );
        if let Some(volume) = credential_volume {
            ctx = ctx.with_volume(volume.clone(), &self.config.credential_mount, true);
        }

        let handle = self
            .runner
            .start_service(&spec, &ctx, self.config.service_port)
            .await?;
        Ok(ServerEndpoint {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            endpoint: format!(
                "{}{}",
                handle.endpoint.trim_end_matches('/'),
                self.config.endpoint_path
            ),
            container_id: handle.container_id,
            job_name: Some(handle.job_name),
        })
    }

    async fn register_server(&self, request: &ProvisionRequest, endpoint: &ServerEndpoint, token: &str) {
        let tools = self.discovery.discover(&endpoint.endpoint).await;
        let registration = ToolRegistration {
            run_id: request.run_id.to_string(),
            node_id: group_node_id(&request.group_instance_id, &endpoint.server_id),
            server_name: endpoint.server_name.clone(),
            server_id: endpoint.server_id.clone(),
            transport: TRANSPORT_HTTP.to_string(),
            endpoint: endpoint.endpoint.clone(),
            container_id: endpoint.container_id.clone(),
            tools,
        };
        if let Err(e) = self.registry.register(token, &registration).await {
            warn!(
                node_id = %registration.node_id,
                error = %e,
                "Failed to register tool server; skipping"
            );
        }
    }
}
