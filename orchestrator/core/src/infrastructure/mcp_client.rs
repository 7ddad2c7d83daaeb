// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! MCP client over streamable HTTP
//!
//! Minimal JSON-RPC 2.0 session against one MCP server endpoint: the
//! `initialize` handshake, `tools/list` with cursor pagination and an
//! explicit session close. Responses may arrive as plain JSON or as a
//! server-sent event stream (`data:` lines).
//!
//! Each session owns its own HTTP client with connection pooling disabled,
//! so a closed session leaves no sockets behind.

use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::tool_group::ToolDescriptor;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Upper bound on `tools/list` pages followed for one server.
const MAX_PAGES: usize = 64;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        McpError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, McpError> {
        match self.error {
            Some(error) => Err(McpError::Server {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct McpHttpConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for McpHttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            client_name: "secflow-runtime".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Extract the JSON-RPC response with `id` from a JSON or SSE body.
pub fn decode_response(body: &str, is_event_stream: bool, id: u64) -> Result<JsonRpcResponse, McpError> {
    let matches_id = |r: &JsonRpcResponse| r.id.as_ref().and_then(Value::as_u64) == Some(id);

    if !is_event_stream {
        let response: JsonRpcResponse = serde_json::from_str(body.trim())?;
        return Ok(response);
    }

    // Events are separated by blank lines; multi-line data fields are joined
    // with '\n'.
    let mut data = String::new();
    let mut candidates = Vec::new();
    for line in body.lines().chain(std::iter::once("")) {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.is_empty() && !data.is_empty() {
            candidates.push(std::mem::take(&mut data));
        }
    }

    candidates
        .iter()
        .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(event).ok())
        .find(matches_id)
        .ok_or_else(|| McpError::Protocol(format!("no response with id {} in event stream", id)))
}

/// One MCP session. Dropping it without [`close`](Self::close) leaves the
/// server-side session to expire on its own.
pub struct McpHttpSession {
    client: reqwest::Client,
    endpoint: String,
    config: McpHttpConfig,
    session_id: Option<String>,
    next_id: u64,
}

impl McpHttpSession {
    pub fn connect(endpoint: &str, config: McpHttpConfig) -> Result<Self, McpError> {
        url::Url::parse(endpoint)
            .map_err(|e| McpError::Transport(format!("invalid URL '{}': {}", endpoint, e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| McpError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            config,
            session_id: None,
            next_id: 1,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn post(&self, body: &JsonRpcRequest) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = &self.session_id {
            req = req.header(SESSION_HEADER, session);
        }
        req
    }

    fn remember_session(&mut self, headers: &HeaderMap) {
        if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            if self.session_id.as_deref() != Some(session) {
                debug!(endpoint = %self.endpoint, session = %session, "MCP session established");
                self.session_id = Some(session.to_string());
            }
        }
    }

    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let body = JsonRpcRequest::request(id, method, params);
        trace!(endpoint = %self.endpoint, method = %method, id, "Sending MCP request");

        let response = self.post(&body).send().await?;
        self.remember_session(response.headers());

        let status = response.status();
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response.text().await?;
        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        decode_response(&text, is_event_stream, id)?.into_result()
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let body = JsonRpcRequest::notification(method, params);
        let response = self.post(&body).send().await?;
        self.remember_session(response.headers());
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// `initialize` followed by `notifications/initialized`.
    pub async fn initialize(&mut self) -> Result<Value, McpError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            }
        });
        let result = self.request("initialize", Some(params)).await?;
        if !result.is_object() {
            return Err(McpError::Protocol("initialize returned no result object".to_string()));
        }
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// All tools, following `nextCursor`.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        Err(McpError::Protocol(format!(
            "tools/list did not finish within {} pages",
            MAX_PAGES
        )))
    }

    /// Terminates the server-side session. Failures are only logged.
    pub async fn close(self) {
        let Some(session) = self.session_id else {
            return;
        };
        match self
            .client
            .delete(&self.endpoint)
            .header(SESSION_HEADER, &session)
            .send()
            .await
        {
            Ok(resp) => debug!(endpoint = %self.endpoint, status = resp.status().as_u16(), "Closed MCP session"),
            Err(e) => debug!(endpoint = %self.endpoint, error = %e, "Failed to close MCP session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_json() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let result = decode_response(body, false, 1).unwrap().into_result().unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn test_decode_event_stream_picks_matching_id() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n";
        let result = decode_response(body, true, 2).unwrap().into_result().unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[test]
    fn test_decode_event_stream_without_trailing_blank_line() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}";
        assert!(decode_response(body, true, 3).is_ok());
        assert!(matches!(
            decode_response(body, true, 4),
            Err(McpError::Protocol(_))
        ));
    }

    #[test]
    fn test_server_error() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#;
        let err = decode_response(body, false, 1).unwrap().into_result().unwrap_err();
        assert!(matches!(err, McpError::Server { code: -32601, .. }));
    }

    #[test]
    fn test_notification_has_no_id() {
        let json = serde_json::to_value(JsonRpcRequest::notification("notifications/initialized", None)).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["jsonrpc"], "2.0");
    }

    #[test]
    fn test_connect_rejects_invalid_url() {
        assert!(matches!(
            McpHttpSession::connect("not a url", McpHttpConfig::default()),
            Err(McpError::Transport(_))
        ));
    }
}
