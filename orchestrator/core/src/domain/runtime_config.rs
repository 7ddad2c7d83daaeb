// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

// Runtime Configuration Types
//
// Defines the configuration schema of the execution runtime:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Execution mode (local container engine or cluster) and timeouts
// - Volume backend selection
// - Backend tool-registry endpoint and internal service token
// - Tool discovery retry policy and group provisioning limits

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::run_spec::PullPolicy;

pub const API_VERSION: &str = "secflow.io/v1";
pub const KIND: &str = "RuntimeConfig";
pub const CONFIG_PATH_ENV: &str = "SECFLOW_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level runtime configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfigManifest {
    /// API version (must be "secflow.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RuntimeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: RuntimeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfigSpec {
    #[serde(default)]
    pub execution: ExecutionSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub kubernetes: KubernetesSettings,

    #[serde(default)]
    pub volumes: VolumeBackendConfig,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub groups: GroupSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Docker,
    Kubernetes,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" | "local" => Ok(ExecutionMode::Docker),
            "kubernetes" | "k8s" => Ok(ExecutionMode::Kubernetes),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub image_pull_policy: PullPolicy,

    /// Applied when a run spec carries no timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Status polling interval of the job runner.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long to wait for the container/pod to appear before giving up.
    #[serde(default = "default_container_wait", with = "humantime_serde")]
    pub container_wait_timeout: Duration,

    /// How long a stay-up service may take to reach `Running`.
    #[serde(default = "default_service_ready", with = "humantime_serde")]
    pub service_ready_timeout: Duration,

    /// Trailing log lines attached to container errors.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            image_pull_policy: PullPolicy::default(),
            default_timeout: default_timeout(),
            poll_interval: default_poll_interval(),
            container_wait_timeout: default_container_wait(),
            service_ready_timeout: default_service_ready(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Docker socket path. Default: local defaults of the engine client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Host address service containers publish their port on.
    #[serde(default = "default_service_host")]
    pub service_host: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            service_host: default_service_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// API server URL. Default: in-cluster service address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: String,

    /// `ttlSecondsAfterFinished` on created jobs, a safety net for the reaper.
    #[serde(default = "default_job_ttl")]
    pub job_ttl_seconds: u32,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            api_server: None,
            token_path: default_token_path(),
            ca_cert_path: default_ca_cert_path(),
            job_ttl_seconds: default_job_ttl(),
        }
    }
}

/// Backing store for isolated volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum VolumeBackendConfig {
    /// Host scratch directories, bind mounted (local engine only).
    Local {
        #[serde(default = "default_local_base")]
        base_path: PathBuf,
    },
    /// Cluster config objects (cluster only).
    ConfigMap,
    /// SeaweedFS filer, mounted through a storage-aware volume driver.
    ObjectStore {
        filer_url: String,
        #[serde(default = "default_object_root")]
        root: String,
        #[serde(default = "default_volume_driver")]
        driver: String,
    },
}

impl Default for VolumeBackendConfig {
    fn default() -> Self {
        VolumeBackendConfig::Local {
            base_path: default_local_base(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL of the backend's internal API (tool registration, tokens).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Service token sent as `X-Internal-Token`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Per HTTP request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Port the MCP HTTP bridge listens on inside each server container.
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// Sibling servers started concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            service_port: default_service_port(),
            max_parallel: default_max_parallel(),
        }
    }
}

// Default value functions
fn default_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_container_wait() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_service_ready() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_log_tail_lines() -> usize {
    50
}

fn default_service_host() -> String {
    "127.0.0.1".to_string()
}

fn default_namespace() -> String {
    "secflow-jobs".to_string()
}

fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ca_cert_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

fn default_job_ttl() -> u32 {
    600
}

fn default_local_base() -> PathBuf {
    std::env::temp_dir().join("secflow-volumes")
}

fn default_object_root() -> String {
    "secflow".to_string()
}

fn default_volume_driver() -> String {
    "seaweedfs".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_service_port() -> u16 {
    8080
}

fn default_max_parallel() -> usize {
    4
}

impl Default for RuntimeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "secflow-runtime".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: RuntimeConfigSpec::default(),
        }
    }
}

impl RuntimeConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Discover configuration file using precedence order
    /// 1. SECFLOW_CONFIG_PATH environment variable
    /// 2. ./secflow-config.yaml (working directory)
    /// 3. ~/.secflow/config.yaml (user home)
    /// 4. /etc/secflow/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./secflow-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".secflow").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/secflow/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(&path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let spec = &mut self.spec;

        if let Some(val) = lookup("SECFLOW_EXECUTION_MODE") {
            match val.parse() {
                Ok(mode) => {
                    tracing::info!("Environment override: SECFLOW_EXECUTION_MODE={}", val);
                    spec.execution.mode = mode;
                }
                Err(e) => tracing::warn!("Ignoring SECFLOW_EXECUTION_MODE: {}", e),
            }
        }

        if let Some(val) = lookup("SECFLOW_K8S_NAMESPACE").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: SECFLOW_K8S_NAMESPACE={}", val);
            spec.kubernetes.namespace = val;
        }

        if let Some(val) = lookup("SECFLOW_IMAGE_PULL_POLICY") {
            match val.parse() {
                Ok(policy) => {
                    tracing::info!("Environment override: SECFLOW_IMAGE_PULL_POLICY={}", val);
                    spec.execution.image_pull_policy = policy;
                }
                Err(e) => tracing::warn!("Ignoring SECFLOW_IMAGE_PULL_POLICY: {}", e),
            }
        }

        if let Some(val) = lookup("SECFLOW_DEFAULT_TIMEOUT") {
            match humantime_serde::re::humantime::parse_duration(&val) {
                Ok(timeout) => {
                    tracing::info!("Environment override: SECFLOW_DEFAULT_TIMEOUT={}", val);
                    spec.execution.default_timeout = timeout;
                }
                Err(e) => tracing::warn!(
                    "Invalid value for SECFLOW_DEFAULT_TIMEOUT: '{}' ({}). Ignoring.",
                    val,
                    e
                ),
            }
        }

        if let Some(val) = lookup("SECFLOW_BACKEND_URL").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: SECFLOW_BACKEND_URL={}", val);
            spec.backend.base_url = Some(val);
        }

        if let Some(val) = lookup("SECFLOW_INTERNAL_TOKEN").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: SECFLOW_INTERNAL_TOKEN=<redacted>");
            spec.backend.internal_token = Some(val);
        }

        if let Some(val) = lookup("SECFLOW_DOCKER_SOCKET").filter(|v| !v.is_empty()) {
            tracing::info!("Environment override: SECFLOW_DOCKER_SOCKET={}", val);
            spec.docker.socket_path = Some(val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.api_version != API_VERSION {
            return invalid(format!(
                "apiVersion '{}' must be '{}'",
                self.api_version, API_VERSION
            ));
        }
        if self.kind != KIND {
            return invalid(format!("kind '{}' must be '{}'", self.kind, KIND));
        }
        if self.metadata.name.is_empty() {
            return invalid("metadata.name cannot be empty".to_string());
        }

        let spec = &self.spec;
        if spec.execution.default_timeout.is_zero() {
            return invalid("spec.execution.default_timeout must be positive".to_string());
        }
        if spec.execution.poll_interval.is_zero() {
            return invalid("spec.execution.poll_interval must be positive".to_string());
        }

        match (&spec.execution.mode, &spec.volumes) {
            (ExecutionMode::Kubernetes, VolumeBackendConfig::Local { .. }) => {
                return invalid(
                    "local volumes require the docker execution mode; use config_map or object_store"
                        .to_string(),
                );
            }
            (ExecutionMode::Docker, VolumeBackendConfig::ConfigMap) => {
                return invalid("config_map volumes require the kubernetes execution mode".to_string());
            }
            (_, VolumeBackendConfig::ObjectStore { filer_url, .. }) if filer_url.is_empty() => {
                return invalid("spec.volumes.filer_url cannot be empty".to_string());
            }
            _ => {}
        }

        if spec.execution.mode == ExecutionMode::Kubernetes && spec.kubernetes.namespace.is_empty() {
            return invalid("spec.kubernetes.namespace cannot be empty".to_string());
        }

        if let Some(url) = &spec.backend.base_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("spec.backend.base_url '{}': {}", url, e)))?;
        }

        if spec.discovery.max_attempts == 0 {
            return invalid("spec.discovery.max_attempts must be at least 1".to_string());
        }
        if spec.discovery.initial_backoff > spec.discovery.max_backoff {
            return invalid("spec.discovery.initial_backoff exceeds max_backoff".to_string());
        }
        if spec.groups.max_parallel == 0 {
            return invalid("spec.groups.max_parallel must be at least 1".to_string());
        }
        if spec.groups.service_port == 0 {
            return invalid("spec.groups.service_port cannot be 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = RuntimeConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.execution.mode, ExecutionMode::Docker);
        assert_eq!(manifest.spec.execution.default_timeout, Duration::from_secs(1800));
        manifest.validate().unwrap();
    }

    #[test]
    fn test_parse_kubernetes_manifest() {
        let yaml = r#"
apiVersion: secflow.io/v1
kind: RuntimeConfig
metadata:
  name: prod
spec:
  execution:
    mode: kubernetes
    default_timeout: 45m
    image_pull_policy: Always
  kubernetes:
    namespace: scans
  volumes:
    backend: object_store
    filer_url: http://seaweedfs-filer:8888
  backend:
    base_url: http://backend:3211/internal
  discovery:
    max_attempts: 3
    initial_backoff: 250ms
"#;
        let manifest = RuntimeConfigManifest::from_yaml_str(yaml).unwrap();
        manifest.validate().unwrap();
        let spec = &manifest.spec;
        assert_eq!(spec.execution.mode, ExecutionMode::Kubernetes);
        assert_eq!(spec.execution.default_timeout, Duration::from_secs(45 * 60));
        assert_eq!(spec.execution.image_pull_policy, PullPolicy::Always);
        assert_eq!(spec.kubernetes.namespace, "scans");
        assert_eq!(spec.discovery.initial_backoff, Duration::from_millis(250));
        assert_eq!(spec.discovery.max_backoff, Duration::from_secs(5));
        assert!(matches!(
            &spec.volumes,
            VolumeBackendConfig::ObjectStore { root, driver, .. } if root == "secflow" && driver == "seaweedfs"
        ));
    }

    #[test]
    fn test_validation() {
        let mut manifest = RuntimeConfigManifest::default();

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.execution.mode = ExecutionMode::Kubernetes;
        assert!(manifest.validate().is_err(), "local volumes on a cluster");
        manifest.spec.volumes = VolumeBackendConfig::ConfigMap;
        manifest.validate().unwrap();

        manifest.spec.backend.base_url = Some("not a url".to_string());
        assert!(manifest.validate().is_err());
        manifest.spec.backend.base_url = None;

        manifest.spec.discovery.max_attempts = 0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut manifest = RuntimeConfigManifest::default();
        let vars = HashMap::from([
            ("SECFLOW_EXECUTION_MODE", "kubernetes"),
            ("SECFLOW_K8S_NAMESPACE", "tenant-a"),
            ("SECFLOW_IMAGE_PULL_POLICY", "Never"),
            ("SECFLOW_DEFAULT_TIMEOUT", "90s"),
            ("SECFLOW_BACKEND_URL", "http://backend:3211"),
            ("SECFLOW_INTERNAL_TOKEN", "svc-token"),
        ]);
        manifest.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        let spec = &manifest.spec;
        assert_eq!(spec.execution.mode, ExecutionMode::Kubernetes);
        assert_eq!(spec.kubernetes.namespace, "tenant-a");
        assert_eq!(spec.execution.image_pull_policy, PullPolicy::Never);
        assert_eq!(spec.execution.default_timeout, Duration::from_secs(90));
        assert_eq!(spec.backend.base_url.as_deref(), Some("http://backend:3211"));
        assert_eq!(spec.backend.internal_token.as_deref(), Some("svc-token"));
    }

    #[test]
    fn test_invalid_env_overrides_are_ignored() {
        let mut manifest = RuntimeConfigManifest::default();
        manifest.apply_overrides_from(|k| match k {
            "SECFLOW_EXECUTION_MODE" => Some("firecracker".to_string()),
            "SECFLOW_DEFAULT_TIMEOUT" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(manifest.spec.execution.mode, ExecutionMode::Docker);
        assert_eq!(manifest.spec.execution.default_timeout, Duration::from_secs(1800));
    }
}
