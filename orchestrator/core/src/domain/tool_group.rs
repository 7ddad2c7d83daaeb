// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tool-server group templates
//!
//! A group template describes a family of sibling MCP servers that share one
//! credential contract (for example every server of a cloud provider's tool
//! suite). Templates are static YAML documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::domain::credentials::CredentialMapping;
use crate::domain::job::JobName;
use crate::domain::runtime::RuntimeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    /// Launch command of the stdio MCP server inside the image.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the group's default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Server already reachable over the network; no container is started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl ServerDescriptor {
    pub fn is_direct(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTemplate {
    pub slug: String,
    pub credential_contract: String,
    pub default_image: String,
    #[serde(default)]
    pub credential_mapping: CredentialMapping,
    /// Render credential files (AWS shared config) in addition to env vars.
    #[serde(default)]
    pub credential_files: bool,
    pub servers: Vec<ServerDescriptor>,
}

impl GroupTemplate {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RuntimeError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RuntimeError::Configuration(format!("invalid group template: {}", e)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Configuration(format!(
                "cannot read group template {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        let bail = |msg: String| Err(RuntimeError::Configuration(msg));

        if self.slug.trim().is_empty() {
            return bail("group template slug cannot be empty".to_string());
        }
        if self.default_image.trim().is_empty() {
            return bail(format!("group template '{}' has no default image", self.slug));
        }
        if self.servers.is_empty() {
            return bail(format!("group template '{}' declares no servers", self.slug));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return bail(format!("group template '{}' has a server without id", self.slug));
            }
            if server.id.contains('/') {
                return bail(format!("server id '{}' may not contain '/'", server.id));
            }
            if !seen.insert(server.id.as_str()) {
                return bail(format!(
                    "group template '{}' declares server '{}' twice",
                    self.slug, server.id
                ));
            }
            if server.endpoint.is_none() && server.command.trim().is_empty() {
                return bail(format!(
                    "server '{}' needs either a launch command or an endpoint",
                    server.id
                ));
            }
        }
        Ok(())
    }

    /// Servers enabled for this instance, in template order.
    pub fn select(&self, enabled_ids: &[String]) -> Result<Vec<&ServerDescriptor>, RuntimeError> {
        let unknown: Vec<&str> = enabled_ids
            .iter()
            .filter(|id| !self.servers.iter().any(|s| &s.id == *id))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(RuntimeError::Configuration(format!(
                "unknown server id(s) for group '{}': {}",
                self.slug,
                unknown.join(", ")
            )));
        }

        Ok(self
            .servers
            .iter()
            .filter(|s| enabled_ids.contains(&s.id))
            .collect())
    }

    pub fn image_for<'a>(&'a self, server: &'a ServerDescriptor) -> &'a str {
        server.image.as_deref().unwrap_or(&self.default_image)
    }
}

/// A reachable tool server of a provisioned group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub server_id: String,
    pub server_name: String,
    pub endpoint: String,
    /// Empty for direct servers.
    pub container_id: String,
    /// Set for container-backed servers; needed for teardown.
    pub job_name: Option<JobName>,
}

/// A tool exposed by an MCP server. `input_schema` is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Lists the tools of a running server. Never fails: an unreachable server
/// yields an empty list.
#[async_trait]
pub trait ToolDiscovery: Send + Sync {
    async fn discover(&self, endpoint: &str) -> Vec<ToolDescriptor>;
}
