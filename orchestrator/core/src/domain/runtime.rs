// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Runtime seam
//!
//! [`JobBackend`] is the port every container platform implements (local
//! container engine, cluster job scheduler). The job runner only talks to
//! this trait, so it stays backend agnostic.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Error taxonomy, backend port, execution context

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::job::{JobName, JobStatus};
use crate::domain::run_spec::{NetworkMode, PullPolicy};
use crate::domain::volume::{IsolatedVolume, RunId, TenantId, VolumeError, VolumeMount};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Bad input. Retrying cannot help.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Container error: {message}")]
    Container {
        message: String,
        log_tail: Option<String>,
    },

    #[error("Timed out after {elapsed:?}: {message}")]
    Timeout { message: String, elapsed: Duration },

    #[error("{context} failed{}: {body}", status_suffix(.status))]
    Service {
        context: String,
        status: Option<u16>,
        body: String,
    },

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

impl RuntimeError {
    pub fn container(message: impl Into<String>) -> Self {
        RuntimeError::Container {
            message: message.into(),
            log_tail: None,
        }
    }

    pub fn service(context: impl Into<String>, status: Option<u16>, body: impl Into<String>) -> Self {
        RuntimeError::Service {
            context: context.into(),
            status,
            body: body.into(),
        }
    }

    /// Whether the workflow engine should retry the step.
    ///
    /// Volume failures count as container-side failures.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RuntimeError::Configuration(_))
    }

    pub fn log_tail(&self) -> Option<&str> {
        match self {
            RuntimeError::Container { log_tail, .. } => log_tail.as_deref(),
            _ => None,
        }
    }
}

// ============================================================================
// Backend port
// ============================================================================

/// Everything a backend needs to create one job. Built by the job runner.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: JobName,
    pub image: String,
    /// Replaces the image entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<VolumeMount>,
    /// Writable ephemeral directories (tmpfs / emptyDir).
    pub scratch_dirs: Vec<String>,
    pub network: NetworkMode,
    pub labels: BTreeMap<String, String>,
    /// Hard limit enforced by the platform where it supports one.
    pub timeout: Option<Duration>,
    pub pull_policy: PullPolicy,
    /// Container port to expose for long-lived service jobs.
    pub service_port: Option<u16>,
}

pub type LogStream = BoxStream<'static, Result<String, RuntimeError>>;

#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Namespace (cluster) or scope (engine) jobs are created in.
    fn namespace(&self) -> &str;

    async fn submit(&self, request: &JobRequest) -> Result<(), RuntimeError>;

    /// Id of the container/pod backing the job once it exists.
    async fn find_container(&self, job: &JobName) -> Result<Option<String>, RuntimeError>;

    async fn status(&self, job: &JobName) -> Result<JobStatus, RuntimeError>;

    /// Follows the combined stdout/stderr stream until the container exits.
    async fn stream_logs(&self, job: &JobName, container: &str) -> Result<LogStream, RuntimeError>;

    /// Complete log text of a finished container.
    async fn final_logs(&self, job: &JobName) -> Result<String, RuntimeError>;

    /// Address at which `port` of a running service job is reachable.
    async fn service_endpoint(&self, job: &JobName, port: u16) -> Result<String, RuntimeError>;

    /// Removes every platform resource of the job. Absent resources are not
    /// an error.
    async fn cleanup(&self, job: &JobName) -> Result<(), RuntimeError>;
}

// ============================================================================
// Execution context
// ============================================================================

/// Receives live container output.
pub trait LogSink: Send + Sync {
    fn emit(&self, job: &JobName, chunk: &str);
}

/// Forwards container output to `tracing` under the `secflow::container` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, job: &JobName, chunk: &str) {
        for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "secflow::container", job = %job, "{}", line);
        }
    }
}

/// A caller-owned volume mounted into the job. The runner writes captured
/// files back into writable ones but never cleans them up.
#[derive(Clone)]
pub struct AttachedVolume {
    pub volume: Arc<dyn IsolatedVolume>,
    pub target: String,
    pub read_only: bool,
}

impl std::fmt::Debug for AttachedVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedVolume")
            .field("backend", &self.volume.backend_name())
            .field("target", &self.target)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[derive(Clone)]
pub struct ExecutionContext {
    pub tenant: TenantId,
    pub run_id: RunId,
    /// Workflow node (component instance) the job executes.
    pub node_ref: String,
    pub log_sink: Arc<dyn LogSink>,
    pub volumes: Vec<AttachedVolume>,
}

impl ExecutionContext {
    pub fn new(tenant: TenantId, run_id: RunId, node_ref: impl Into<String>) -> Self {
        Self {
            tenant,
            run_id,
            node_ref: node_ref.into(),
            log_sink: Arc::new(TracingLogSink),
            volumes: Vec::new(),
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_volume(
        mut self,
        volume: Arc<dyn IsolatedVolume>,
        target: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.volumes.push(AttachedVolume {
            volume,
            target: target.into(),
            read_only,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!RuntimeError::Configuration("bad".into()).is_retryable());
        assert!(RuntimeError::container("boom").is_retryable());
        assert!(RuntimeError::Timeout {
            message: "slow".into(),
            elapsed: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(RuntimeError::service("registry", Some(503), "busy").is_retryable());
        assert!(RuntimeError::Volume(VolumeError::Backend("down".into())).is_retryable());
    }

    #[test]
    fn test_service_error_display() {
        let err = RuntimeError::service("tool registration", Some(401), "unauthorized");
        assert_eq!(
            err.to_string(),
            "tool registration failed with status 401: unauthorized"
        );
        let err = RuntimeError::service("token issuance", None, "connection refused");
        assert_eq!(err.to_string(), "token issuance failed: connection refused");
    }

    #[test]
    fn test_log_tail_accessor() {
        let err = RuntimeError::Container {
            message: "exit 1".into(),
            log_tail: Some("last line".into()),
        };
        assert_eq!(err.log_tail(), Some("last line"));
        assert_eq!(RuntimeError::Configuration("x".into()).log_tail(), None);
    }
}
