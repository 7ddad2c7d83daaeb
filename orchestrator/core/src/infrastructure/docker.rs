// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Docker job backend
//!
//! Runs each job as one named container on the local engine. The container
//! name is the job name, so lookups never need a label query. Output and
//! other scratch directories are tmpfs mounts; object-store volumes are
//! mounted through their volume driver.

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum,
    MountVolumeOptions, MountVolumeOptionsDriverConfig, PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
};
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::domain::job::{JobName, JobStatus};
use crate::domain::run_spec::{NetworkMode, PullPolicy};
use crate::domain::runtime::{JobBackend, JobRequest, LogStream, RuntimeError};
use crate::domain::volume::{MountSource, VolumeMount};

const LOG_CHANNEL_CAPACITY: usize = 64;

pub struct DockerJobBackend {
    docker: Docker,
    service_host: String,
}

impl DockerJobBackend {
    pub fn new(socket_path: Option<&str>, service_host: impl Into<String>) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => {
                #[cfg(unix)]
                let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

                #[cfg(windows)]
                let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

                result.map_err(|e| {
                    RuntimeError::Configuration(format!(
                        "Failed to connect to Docker at {}: {}\n\n\
                         Ensure Docker is running and the socket path is correct.",
                        path, e
                    ))
                })?
            }
            None => Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::Configuration(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?,
        };
        Ok(Self::with_client(docker, service_host))
    }

    pub fn with_client(docker: Docker, service_host: impl Into<String>) -> Self {
        Self {
            docker,
            service_host: service_host.into(),
        }
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::container(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<(), RuntimeError> {
        let present = self.docker.inspect_image(image).await.is_ok();
        let pull = match policy {
            PullPolicy::Always => true,
            PullPolicy::IfNotPresent => !present,
            PullPolicy::Never if present => false,
            PullPolicy::Never => {
                return Err(RuntimeError::container(format!(
                    "Image {} not found locally and pull policy is Never",
                    image
                )))
            }
        };
        if !pull {
            return Ok(());
        }

        info!(image = %image, policy = policy.as_str(), "Pulling image");
        let (from_image, tag) = split_image_reference(image);
        let mut options = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        self.docker
            .create_image(Some(options.build()), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| {
                RuntimeError::container(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                ))
            })?;
        info!(image = %image, "Successfully pulled image");
        Ok(())
    }

    async fn inspect(&self, job: &JobName) -> Result<Option<bollard::models::ContainerInspectResponse>, RuntimeError> {
        match self
            .docker
            .inspect_container(job.as_str(), None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(docker_error("inspect container", job, e)),
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn docker_error(operation: &str, job: &JobName, error: BollardError) -> RuntimeError {
    RuntimeError::container(format!("Docker {} for {} failed: {}", operation, job, error))
}

/// Splits `repo[:tag]` for the pull API. Digest references and references
/// whose last `:` belongs to a registry port are passed through untagged.
pub fn split_image_reference(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (&image[..split], Some(&image[split + 1..]))
        }
        None => (image, Some("latest")),
    }
}

fn to_docker_mount(mount: &VolumeMount) -> Result<Mount, RuntimeError> {
    let base = Mount {
        target: Some(mount.target.clone()),
        read_only: Some(mount.read_only),
        ..Default::default()
    };
    match &mount.source {
        MountSource::HostPath { path } => Ok(Mount {
            source: Some(path.clone()),
            typ: Some(MountTypeEnum::BIND),
            ..base
        }),
        MountSource::EmptyDir => Ok(Mount {
            typ: Some(MountTypeEnum::TMPFS),
            ..base
        }),
        MountSource::ObjectStore {
            driver,
            volume_name,
            path,
        } => Ok(Mount {
            source: Some(volume_name.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            volume_options: Some(MountVolumeOptions {
                driver_config: Some(MountVolumeOptionsDriverConfig {
                    name: Some(driver.clone()),
                    options: Some(HashMap::from([("path".to_string(), path.clone())])),
                }),
                ..Default::default()
            }),
            ..base
        }),
        MountSource::ConfigMap { name, .. } => Err(RuntimeError::Configuration(format!(
            "ConfigMap volume {} cannot be mounted by the Docker backend",
            name
        ))),
    }
}

/// Container definition for a job request. Pure so it can be unit tested.
pub fn build_container_body(request: &JobRequest, service_host: &str) -> Result<ContainerCreateBody, RuntimeError> {
    let mut mounts = request
        .mounts
        .iter()
        .map(to_docker_mount)
        .collect::<Result<Vec<_>, _>>()?;
    mounts.extend(request.scratch_dirs.iter().map(|dir| Mount {
        target: Some(dir.clone()),
        typ: Some(MountTypeEnum::TMPFS),
        ..Default::default()
    }));

    let port_bindings = match (request.service_port, &request.network) {
        (Some(port), network) if *network != NetworkMode::Host => Some(HashMap::from([(
            format!("{}/tcp", port),
            Some(vec![PortBinding {
                host_ip: Some(service_host.to_string()),
                host_port: Some(String::new()),
            }]),
        )])),
        _ => None,
    };

    let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

    Ok(ContainerCreateBody {
        image: Some(request.image.clone()),
        entrypoint: request.entrypoint.clone(),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        env: (!env.is_empty()).then_some(env),
        labels: Some(request.labels.clone().into_iter().collect()),
        host_config: Some(HostConfig {
            mounts: Some(mounts),
            network_mode: Some(request.network.as_docker_mode().to_string()),
            port_bindings,
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    })
}

fn status_from_state(state: Option<bollard::models::ContainerState>) -> JobStatus {
    let Some(state) = state else {
        return JobStatus::Pending;
    };
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING)
        | Some(ContainerStateStatusEnum::PAUSED)
        | Some(ContainerStateStatusEnum::RESTARTING) => JobStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            match state.exit_code {
                Some(0) => JobStatus::Succeeded { exit_code: 0 },
                code => {
                    let reason = if state.oom_killed == Some(true) {
                        "OOMKilled".to_string()
                    } else {
                        state
                            .error
                            .filter(|e| !e.is_empty())
                            .unwrap_or_else(|| format!("exited with code {}", code.unwrap_or(-1)))
                    };
                    JobStatus::Failed {
                        exit_code: code,
                        reason,
                    }
                }
            }
        }
        _ => JobStatus::Pending,
    }
}

#[async_trait]
impl JobBackend for DockerJobBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn namespace(&self) -> &str {
        "local"
    }

    async fn submit(&self, request: &JobRequest) -> Result<(), RuntimeError> {
        self.ensure_image(&request.image, request.pull_policy).await?;

        let body = build_container_body(request, &self.service_host)?;
        let created = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::new()
                        .name(request.name.as_str())
                        .build(),
                ),
                body,
            )
            .await
            .map_err(|e| docker_error("create container", &request.name, e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let err = docker_error("start container", &request.name, e);
            if let Err(cleanup) = self.cleanup(&request.name).await {
                warn!(job = %request.name, error = %cleanup, "Failed to remove unstartable container");
            }
            return Err(err);
        }

        info!(job = %request.name, container = %created.id, image = %request.image, "Started job container");
        Ok(())
    }

    async fn find_container(&self, job: &JobName) -> Result<Option<String>, RuntimeError> {
        Ok(self.inspect(job).await?.and_then(|inspect| inspect.id))
    }

    async fn status(&self, job: &JobName) -> Result<JobStatus, RuntimeError> {
        match self.inspect(job).await? {
            Some(inspect) => Ok(status_from_state(inspect.state)),
            None => Ok(JobStatus::Failed {
                exit_code: None,
                reason: "container no longer exists".to_string(),
            }),
        }
    }

    async fn stream_logs(&self, job: &JobName, container: &str) -> Result<LogStream, RuntimeError> {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        let container = container.to_string();
        let job = job.clone();

        tokio::spawn(async move {
            let options = LogsOptionsBuilder::new()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut logs = std::pin::pin!(docker.logs(&container, Some(options)));
            while let Some(chunk) = logs.next().await {
                let item = chunk
                    .map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
                    .map_err(|e| docker_error("log stream", &job, e));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            debug!(job = %job, "Docker log stream ended");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn final_logs(&self, job: &JobName) -> Result<String, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .follow(false)
            .stdout(true)
            .stderr(true)
            .build();
        let chunks: Vec<_> = self
            .docker
            .logs(job.as_str(), Some(options))
            .try_collect()
            .await
            .map_err(|e| docker_error("read logs", job, e))?;
        Ok(chunks
            .into_iter()
            .map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
            .collect())
    }

    async fn service_endpoint(&self, job: &JobName, port: u16) -> Result<String, RuntimeError> {
        let inspect = self
            .inspect(job)
            .await?
            .ok_or_else(|| RuntimeError::container(format!("container for {} not found", job)))?;
        let settings = inspect.network_settings.unwrap_or_default();

        let published = settings
            .ports
            .as_ref()
            .and_then(|ports| ports.get(&format!("{}/tcp", port)))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| {
                bindings
                    .iter()
                    .find_map(|b| b.host_port.clone().filter(|p| !p.is_empty()))
            });
        if let Some(host_port) = published {
            return Ok(format!("http://{}:{}", self.service_host, host_port));
        }

        let ip = settings
            .networks
            .unwrap_or_default()
            .into_values()
            .find_map(|n| n.ip_address.filter(|ip| !ip.is_empty()));
        match ip {
            Some(ip) => Ok(format!("http://{}:{}", ip, port)),
            None => Err(RuntimeError::container(format!(
                "container for {} has no published port {} and no network address",
                job, port
            ))),
        }
    }

    async fn cleanup(&self, job: &JobName) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        match self.docker.remove_container(job.as_str(), Some(options)).await {
            Ok(()) => {
                debug!(job = %job, "Removed job container");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("remove container", job, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> JobRequest {
        JobRequest {
            name: JobName::from_existing("sf-run-node-abc123"),
            image: "alpine:3.20".into(),
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            command: vec!["echo hi".into()],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            mounts: vec![VolumeMount {
                source: MountSource::HostPath {
                    path: "/tmp/secflow/in".into(),
                },
                target: "/secflow/input".into(),
                read_only: true,
            }],
            scratch_dirs: vec!["/secflow/output".into()],
            network: NetworkMode::Bridge,
            labels: BTreeMap::from([("secflow.io/managed".to_string(), "true".to_string())]),
            timeout: None,
            pull_policy: PullPolicy::IfNotPresent,
            service_port: None,
        }
    }

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("alpine"), ("alpine", Some("latest")));
        assert_eq!(split_image_reference("alpine:3.20"), ("alpine", Some("3.20")));
        assert_eq!(
            split_image_reference("registry:5000/team/tool"),
            ("registry:5000/team/tool", Some("latest"))
        );
        assert_eq!(
            split_image_reference("registry:5000/team/tool:v2"),
            ("registry:5000/team/tool", Some("v2"))
        );
        assert_eq!(
            split_image_reference("alpine@sha256:abcd"),
            ("alpine@sha256:abcd", None)
        );
    }

    #[test]
    fn test_container_body_mounts_and_env() {
        let body = build_container_body(&request(), "127.0.0.1").unwrap();
        let host = body.host_config.unwrap();
        let mounts = host.mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].typ, Some(MountTypeEnum::TMPFS));
        assert_eq!(mounts[1].target.as_deref(), Some("/secflow/output"));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert!(host.port_bindings.is_none());
        assert_eq!(body.env, Some(vec!["A=1".to_string()]));
        assert_eq!(body.cmd, Some(vec!["echo hi".to_string()]));
    }

    #[test]
    fn test_service_port_is_published_on_service_host() {
        let mut req = request();
        req.service_port = Some(8080);
        let body = build_container_body(&req, "127.0.0.1").unwrap();
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_object_store_mount_uses_driver() {
        let mut req = request();
        req.mounts = vec![VolumeMount {
            source: MountSource::ObjectStore {
                driver: "seaweedfs".into(),
                volume_name: "sfv-run-data-1a2b".into(),
                path: "/secflow/default/run/data-1a2b".into(),
            },
            target: "/data".into(),
            read_only: false,
        }];
        let body = build_container_body(&req, "127.0.0.1").unwrap();
        let mount = &body.host_config.unwrap().mounts.unwrap()[0];
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
        let driver = mount
            .volume_options
            .as_ref()
            .and_then(|o| o.driver_config.as_ref())
            .unwrap();
        assert_eq!(driver.name.as_deref(), Some("seaweedfs"));
    }

    #[test]
    fn test_config_map_mount_is_rejected() {
        let mut req = request();
        req.mounts = vec![VolumeMount {
            source: MountSource::ConfigMap {
                name: "cm".into(),
                items: vec![],
            },
            target: "/cfg".into(),
            read_only: true,
        }];
        assert!(matches!(
            build_container_body(&req, "127.0.0.1"),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        use bollard::models::ContainerState;

        assert_eq!(status_from_state(None), JobStatus::Pending);
        let running = ContainerState {
            status: Some(ContainerStateStatusEnum::RUNNING),
            ..Default::default()
        };
        assert_eq!(status_from_state(Some(running)), JobStatus::Running);

        let ok = ContainerState {
            status: Some(ContainerStateStatusEnum::EXITED),
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(status_from_state(Some(ok)), JobStatus::Succeeded { exit_code: 0 });

        let oom = ContainerState {
            status: Some(ContainerStateStatusEnum::EXITED),
            exit_code: Some(137),
            oom_killed: Some(true),
            ..Default::default()
        };
        assert_eq!(
            status_from_state(Some(oom)),
            JobStatus::Failed {
                exit_code: Some(137),
                reason: "OOMKilled".into()
            }
        );
    }

    #[tokio::test]
    #[ignore] // Requires a running Docker daemon
    async fn test_healthcheck_against_local_engine() {
        let backend = DockerJobBackend::new(None, "127.0.0.1").unwrap();
        backend.healthcheck().await.unwrap();
    }
}
