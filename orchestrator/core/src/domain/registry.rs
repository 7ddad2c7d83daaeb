// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tool registry port
//!
//! The backend keeps a per-run registry of tools that AI agent nodes may call.
//! The group runtime registers each discovered server here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::runtime::RuntimeError;
use crate::domain::tool_group::ToolDescriptor;

pub const TRANSPORT_HTTP: &str = "http";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRegistration {
    pub run_id: String,
    /// `<groupInstanceId>/<serverId>`
    pub node_id: String,
    pub server_name: String,
    pub server_id: String,
    pub transport: String,
    pub endpoint: String,
    pub container_id: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Node id under which a sibling server is registered.
pub fn group_node_id(group_instance_id: &str, server_id: &str) -> String {
    format!("{}/{}", group_instance_id, server_id)
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Issue a registration token scoped to `node_ids` of `run_id`.
    async fn issue_token(&self, run_id: &str, node_ids: &[String]) -> Result<String, RuntimeError>;

    async fn register(&self, token: &str, registration: &ToolRegistration) -> Result<(), RuntimeError>;
}
