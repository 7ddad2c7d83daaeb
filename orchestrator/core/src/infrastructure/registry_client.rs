// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Backend tool-registry client
//!
//! # API Endpoints
//!
//! - `POST {base}/generate-token` - scoped registration token
//!   (authenticated with the `X-Internal-Token` service token)
//! - `POST {base}/tool-registration` - register one server and its tools
//!   (authenticated with `Authorization: Bearer <token>`)
//!
//! [`InMemoryToolRegistry`] keeps registrations in process for runs without a
//! backend (CLI use, tests).

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::registry::{ToolRegistration, ToolRegistry};
use crate::domain::runtime::RuntimeError;

pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

pub struct BackendRegistryClient {
    client: Client,
    base_url: String,
    internal_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    run_id: &'a str,
    allowed_node_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl BackendRegistryClient {
    pub fn new(base_url: impl Into<String>, internal_token: Option<String>) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RuntimeError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            internal_token,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn service_error(context: &str, response: reqwest::Response) -> RuntimeError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| format!("HTTP {}", status));
    RuntimeError::service(context, Some(status.as_u16()), body)
}

#[async_trait]
impl ToolRegistry for BackendRegistryClient {
    async fn issue_token(&self, run_id: &str, node_ids: &[String]) -> Result<String, RuntimeError> {
        let mut req = self.client.post(self.build_url("/generate-token")).json(&TokenRequest {
            run_id,
            allowed_node_ids: node_ids,
        });
        if let Some(token) = &self.internal_token {
            req = req.header(INTERNAL_TOKEN_HEADER, token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| RuntimeError::service("token issuance", None, e.to_string()))?;
        if !response.status().is_success() {
            return Err(service_error("token issuance", response).await);
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::service("token issuance", None, format!("invalid response: {}", e)))?;
        tracing::debug!(run_id = %run_id, nodes = node_ids.len(), "Issued tool registration token");
        Ok(body.token)
    }

    async fn register(&self, token: &str, registration: &ToolRegistration) -> Result<(), RuntimeError> {
        let response = self
            .client
            .post(self.build_url("/tool-registration"))
            .bearer_auth(token)
            .json(registration)
            .send()
            .await
            .map_err(|e| RuntimeError::service("tool registration", None, e.to_string()))?;

        if !response.status().is_success() {
            return Err(service_error("tool registration", response).await);
        }
        tracing::info!(
            run_id = %registration.run_id,
            node_id = %registration.node_id,
            tools = registration.tools.len(),
            "Registered tool server"
        );
        Ok(())
    }
}

/// Registry that only records what would have been registered.
#[derive(Debug, Default)]
pub struct InMemoryToolRegistry {
    registrations: Mutex<Vec<ToolRegistration>>,
    tokens: Mutex<Vec<(String, Vec<String>)>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registrations(&self) -> Vec<ToolRegistration> {
        self.registrations.lock().clone()
    }

    /// `(run_id, allowed node ids)` of every issued token.
    pub fn issued_tokens(&self) -> Vec<(String, Vec<String>)> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn issue_token(&self, run_id: &str, node_ids: &[String]) -> Result<String, RuntimeError> {
        self.tokens.lock().push((run_id.to_string(), node_ids.to_vec()));
        Ok(format!("local-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn register(&self, _token: &str, registration: &ToolRegistration) -> Result<(), RuntimeError> {
        tracing::info!(
            node_id = %registration.node_id,
            endpoint = %registration.endpoint,
            tools = registration.tools.len(),
            "Recorded tool server registration"
        );
        self.registrations.lock().push(registration.clone());
        Ok(())
    }
}
