// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Tool-Discovery Client
//!
//! Retrying MCP handshake against a freshly started tool server. Servers
//! usually need a few seconds after their container reports `Running`
//! before they accept connections, so discovery retries with exponential
//! backoff. Discovery failures are soft: the caller gets an empty list.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::runtime_config::DiscoverySettings;
use crate::domain::tool_group::{ToolDescriptor, ToolDiscovery};
use crate::infrastructure::mcp_client::{McpError, McpHttpConfig, McpHttpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Total sleep across all attempts; no sleep follows the last one.
    pub fn total_backoff_budget(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|n| self.backoff_for(n))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DiscoverySettings::default())
    }
}

impl From<&DiscoverySettings> for RetryPolicy {
    fn from(settings: &DiscoverySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
        }
    }
}

pub struct McpToolDiscovery {
    policy: RetryPolicy,
    http: McpHttpConfig,
}

impl McpToolDiscovery {
    pub fn new(policy: RetryPolicy, http: McpHttpConfig) -> Self {
        Self { policy, http }
    }

    pub fn from_settings(settings: &DiscoverySettings) -> Self {
        Self::new(
            RetryPolicy::from(settings),
            McpHttpConfig {
                timeout: settings.request_timeout,
                ..McpHttpConfig::default()
            },
        )
    }

    async fn attempt(&self, endpoint: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut session = McpHttpSession::connect(endpoint, self.http.clone())?;
        let outcome = async {
            session.initialize().await?;
            session.list_tools().await
        }
        .await;
        session.close().await;
        outcome
    }
}

#[async_trait]
impl ToolDiscovery for McpToolDiscovery {
    async fn discover(&self, endpoint: &str) -> Vec<ToolDescriptor> {
        for attempt in 0..self.policy.max_attempts {
            match self.attempt(endpoint).await {
                Ok(tools) => {
                    info!(endpoint = %endpoint, tools = tools.len(), attempt = attempt + 1, "Discovered MCP tools");
                    return tools;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, attempt = attempt + 1, error = %e, "MCP discovery attempt failed");
                    if attempt + 1 < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff_for(attempt)).await;
                    }
                }
            }
        }
        warn!(
            endpoint = %endpoint,
            attempts = self.policy.max_attempts,
            "MCP tool discovery gave up; registering server without tools"
        );
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
        assert_eq!(policy.total_backoff_budget(), Duration::from_millis(1200));
    }

    #[test]
    fn test_single_attempt_has_no_backoff() {
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.total_backoff_budget(), Duration::ZERO);
    }
}
