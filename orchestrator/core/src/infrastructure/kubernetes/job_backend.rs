// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes job backend
//!
//! One `batch/v1` Job per run with `backoffLimit: 0`; the single pod is
//! located through the `job-name` label the Job controller adds.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{is_conflict, KubeClient, KubeError};
use crate::domain::job::{JobName, JobStatus};
use crate::domain::run_spec::NetworkMode;
use crate::domain::runtime::{JobBackend, JobRequest, LogStream, RuntimeError};
use crate::domain::volume::{MountSource, VolumeMount};

const CONTAINER_NAME: &str = "main";

/// Waiting reasons that never resolve without intervention.
const STUCK_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
    "CreateContainerConfigError",
    "CreateContainerError",
];

pub struct KubernetesJobBackend {
    client: KubeClient,
    namespace: String,
    ttl_seconds: u32,
}

impl KubernetesJobBackend {
    pub fn new(client: KubeClient, namespace: impl Into<String>, ttl_seconds: u32) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            ttl_seconds,
        }
    }

    fn jobs_path(&self) -> String {
        format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace)
    }

    fn pods_path(&self) -> String {
        format!("/api/v1/namespaces/{}/pods", self.namespace)
    }

    async fn find_pod(&self, job: &JobName) -> Result<Option<Value>, RuntimeError> {
        let selector = format!("job-name={}", job);
        let list: Value = self
            .client
            .get(&self.pods_path(), &[("labelSelector", selector.as_str())])
            .await?;
        Ok(list["items"].as_array().and_then(|items| items.first()).cloned())
    }
}

fn volume_for(mount: &VolumeMount, name: &str) -> Result<Value, RuntimeError> {
    let source = match &mount.source {
        MountSource::ConfigMap { name: cm, items } => json!({
            "configMap": {
                "name": cm,
                "items": items.iter().map(|i| json!({"key": i.key, "path": i.path})).collect::<Vec<_>>(),
            }
        }),
        MountSource::EmptyDir => json!({ "emptyDir": {} }),
        MountSource::ObjectStore {
            driver,
            volume_name,
            path,
        } => json!({
            "csi": {
                "driver": driver,
                "readOnly": mount.read_only,
                "volumeAttributes": { "volumeName": volume_name, "path": path },
            }
        }),
        MountSource::HostPath { path } => {
            return Err(RuntimeError::Configuration(format!(
                "host path {} cannot be mounted by the Kubernetes backend",
                path
            )))
        }
    };
    let mut volume = json!({ "name": name });
    if let (Some(obj), Value::Object(src)) = (volume.as_object_mut(), source) {
        obj.extend(src);
    }
    Ok(volume)
}

/// Job manifest for a request. Pure so it can be unit tested.
pub fn build_job_manifest(request: &JobRequest, namespace: &str, ttl_seconds: u32) -> Result<Value, RuntimeError> {
    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();

    for (i, mount) in request.mounts.iter().enumerate() {
        let name = format!("vol-{}", i);
        volumes.push(volume_for(mount, &name)?);
        volume_mounts.push(json!({
            "name": name,
            "mountPath": mount.target,
            "readOnly": mount.read_only,
        }));
    }
    for (i, dir) in request.scratch_dirs.iter().enumerate() {
        let name = format!("scratch-{}", i);
        volumes.push(json!({ "name": name, "emptyDir": {} }));
        volume_mounts.push(json!({ "name": name, "mountPath": dir }));
    }

    if !matches!(request.network, NetworkMode::Bridge) {
        debug!(job = %request.name, network = %request.network.as_docker_mode(), "Network mode ignored on Kubernetes");
    }

    let mut container = json!({
        "name": CONTAINER_NAME,
        "image": request.image,
        "imagePullPolicy": request.pull_policy.as_str(),
        "env": request.env.iter().map(|(k, v)| json!({"name": k, "value": v})).collect::<Vec<_>>(),
        "volumeMounts": volume_mounts,
    });
    if let Some(entrypoint) = &request.entrypoint {
        container["command"] = json!(entrypoint);
    }
    if !request.command.is_empty() {
        container["args"] = json!(request.command);
    }
    if let Some(port) = request.service_port {
        container["ports"] = json!([{ "containerPort": port, "protocol": "TCP" }]);
    }

    let mut spec = json!({
        "backoffLimit": 0,
        "ttlSecondsAfterFinished": ttl_seconds,
        "template": {
            "metadata": { "labels": request.labels },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
                "volumes": volumes,
            }
        }
    });
    if let Some(timeout) = request.timeout {
        spec["activeDeadlineSeconds"] = json!(timeout.as_secs().max(1));
    }

    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": request.name.as_str(),
            "namespace": namespace,
            "labels": request.labels,
        },
        "spec": spec,
    }))
}

fn container_status(pod: &Value) -> Option<&Value> {
    pod["status"]["containerStatuses"]
        .as_array()
        .and_then(|statuses| statuses.iter().find(|s| s["name"] == CONTAINER_NAME))
}

fn terminated_exit_code(pod: Option<&Value>) -> Option<i64> {
    pod.and_then(container_status)
        .and_then(|s| s["state"]["terminated"]["exitCode"].as_i64())
}

/// Maps a Job and (optionally) its pod onto a [`JobStatus`].
pub(crate) fn status_from_resources(job: &Value, pod: Option<&Value>) -> JobStatus {
    let status = &job["status"];
    if status["succeeded"].as_i64().unwrap_or(0) > 0 {
        return JobStatus::Succeeded {
            exit_code: terminated_exit_code(pod).unwrap_or(0),
        };
    }

    let failed_condition = status["conditions"].as_array().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c["type"] == "Failed" && c["status"] == "True")
    });
    if status["failed"].as_i64().unwrap_or(0) > 0 || failed_condition.is_some() {
        let reason = failed_condition
            .and_then(|c| c["reason"].as_str())
            .unwrap_or("BackoffLimitExceeded")
            .to_string();
        return JobStatus::Failed {
            exit_code: terminated_exit_code(pod),
            reason,
        };
    }

    let Some(pod) = pod else {
        return JobStatus::Pending;
    };
    if let Some(waiting) = container_status(pod).map(|s| &s["state"]["waiting"]) {
        if let Some(reason) = waiting["reason"]
            .as_str()
            .filter(|r| STUCK_WAITING_REASONS.contains(r))
        {
            let message = waiting["message"].as_str().unwrap_or_default();
            return JobStatus::Failed {
                exit_code: None,
                reason: format!("{}: {}", reason, message).trim_end_matches(": ").to_string(),
            };
        }
    }
    match pod["status"]["phase"].as_str() {
        Some("Running") => JobStatus::Running,
        _ => JobStatus::Pending,
    }
}

fn container_started(pod: &Value) -> bool {
    container_status(pod).is_some_and(|s| {
        s["state"].get("running").is_some() || s["state"].get("terminated").is_some()
    })
}

#[async_trait]
impl JobBackend for KubernetesJobBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn submit(&self, request: &JobRequest) -> Result<(), RuntimeError> {
        let manifest = build_job_manifest(request, &self.namespace, self.ttl_seconds)?;
        match self.client.create(&self.jobs_path(), &manifest).await {
            Ok(_) => {
                info!(job = %request.name, namespace = %self.namespace, image = %request.image, "Created Kubernetes job");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Err(RuntimeError::container(format!(
                "job {} already exists in namespace {}",
                request.name, self.namespace
            ))),
            Err(e) => Err(RuntimeError::container(format!(
                "failed to create job {}: {}",
                request.name, e
            ))),
        }
    }

    async fn find_container(&self, job: &JobName) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .find_pod(job)
            .await?
            .filter(container_started)
            .and_then(|pod| pod["metadata"]["name"].as_str().map(str::to_string)))
    }

    async fn status(&self, job: &JobName) -> Result<JobStatus, RuntimeError> {
        let resource: Value = match self
            .client
            .get(&format!("{}/{}", self.jobs_path(), job), &[])
            .await
        {
            Ok(value) => value,
            Err(e) if e.is_not_found() => {
                return Ok(JobStatus::Failed {
                    exit_code: None,
                    reason: "job no longer exists".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let pod = self.find_pod(job).await?;
        Ok(status_from_resources(&resource, pod.as_ref()))
    }

    async fn stream_logs(&self, job: &JobName, container: &str) -> Result<LogStream, RuntimeError> {
        let path = format!("{}/{}/log", self.pods_path(), container);
        let job = job.clone();
        let stream = self
            .client
            .stream(&path, &[("follow", "true"), ("container", CONTAINER_NAME)])
            .await?;
        Ok(stream
            .map(move |chunk| {
                chunk
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(|e: KubeError| {
                        RuntimeError::container(format!("log stream for {} failed: {}", job, e))
                    })
            })
            .boxed())
    }

    async fn final_logs(&self, job: &JobName) -> Result<String, RuntimeError> {
        let Some(pod) = self.find_pod(job).await? else {
            return Ok(String::new());
        };
        let Some(name) = pod["metadata"]["name"].as_str() else {
            return Ok(String::new());
        };
        match self
            .client
            .get_text(
                &format!("{}/{}/log", self.pods_path(), name),
                &[("container", CONTAINER_NAME)],
            )
            .await
        {
            Ok(logs) => Ok(logs),
            // Container never started (image pull failure): no logs to read.
            Err(KubeError::Api { status: 400, .. }) => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn service_endpoint(&self, job: &JobName, port: u16) -> Result<String, RuntimeError> {
        let pod = self
            .find_pod(job)
            .await?
            .ok_or_else(|| RuntimeError::container(format!("pod for {} not found", job)))?;
        match pod["status"]["podIP"].as_str().filter(|ip| !ip.is_empty()) {
            Some(ip) => Ok(format!("http://{}:{}", ip, port)),
            None => Err(RuntimeError::container(format!("pod for {} has no IP yet", job))),
        }
    }

    async fn cleanup(&self, job: &JobName) -> Result<(), RuntimeError> {
        self.client
            .delete(
                &format!("{}/{}", self.jobs_path(), job),
                &[("propagationPolicy", "Background")],
            )
            .await?;
        debug!(job = %job, namespace = %self.namespace, "Deleted Kubernetes job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run_spec::PullPolicy;
    use crate::domain::volume::KeyPath;
    use crate::infrastructure::kubernetes::KubeConfig;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request() -> JobRequest {
        JobRequest {
            name: JobName::from_existing("sf-run-node-abc123"),
            image: "ghcr.io/secflow/scanner:1.0".into(),
            entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
            command: vec!["run-scan".into()],
            env: BTreeMap::from([("SECFLOW_RUN_ID".to_string(), "run".to_string())]),
            mounts: vec![VolumeMount {
                source: MountSource::ConfigMap {
                    name: "sfv-run-input-1a2b".into(),
                    items: vec![KeyPath {
                        key: "cGFyYW1zLmpzb24".into(),
                        path: "params.json".into(),
                    }],
                },
                target: "/secflow/input".into(),
                read_only: true,
            }],
            scratch_dirs: vec!["/secflow/output".into()],
            network: NetworkMode::Bridge,
            labels: BTreeMap::from([("secflow.io/managed".to_string(), "true".to_string())]),
            timeout: Some(Duration::from_secs(90)),
            pull_policy: PullPolicy::Always,
            service_port: None,
        }
    }

    #[test]
    fn test_manifest_shape() {
        let manifest = build_job_manifest(&request(), "secflow-jobs", 600).unwrap();
        assert_eq!(manifest["metadata"]["namespace"], "secflow-jobs");
        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 90);
        assert_eq!(manifest["spec"]["ttlSecondsAfterFinished"], 600);

        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        let container = &pod["containers"][0];
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(container["command"], json!(["/bin/sh", "-c"]));
        assert_eq!(container["args"], json!(["run-scan"]));

        let volumes = pod["volumes"].as_array().unwrap();
        assert_eq!(volumes[0]["configMap"]["items"][0]["path"], "params.json");
        assert!(volumes[1]["emptyDir"].is_object());
        assert_eq!(container["volumeMounts"][1]["mountPath"], "/secflow/output");
    }

    #[test]
    fn test_service_without_deadline_exposes_port() {
        let mut req = request();
        req.timeout = None;
        req.service_port = Some(8080);
        let manifest = build_job_manifest(&req, "ns", 60).unwrap();
        assert!(manifest["spec"].get("activeDeadlineSeconds").is_none());
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["ports"][0]["containerPort"],
            8080
        );
    }

    #[test]
    fn test_host_path_rejected() {
        let mut req = request();
        req.mounts[0].source = MountSource::HostPath { path: "/tmp/x".into() };
        assert!(matches!(
            build_job_manifest(&req, "ns", 60),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_status_succeeded_and_failed() {
        let job = json!({"status": {"succeeded": 1}});
        assert_eq!(status_from_resources(&job, None), JobStatus::Succeeded { exit_code: 0 });

        let job = json!({"status": {"failed": 1, "conditions": [
            {"type": "Failed", "status": "True", "reason": "DeadlineExceeded"}
        ]}});
        let pod = json!({"status": {"containerStatuses": [
            {"name": "main", "state": {"terminated": {"exitCode": 137}}}
        ]}});
        assert_eq!(
            status_from_resources(&job, Some(&pod)),
            JobStatus::Failed {
                exit_code: Some(137),
                reason: "DeadlineExceeded".into()
            }
        );
    }

    #[test]
    fn test_image_pull_backoff_is_failure() {
        let job = json!({"status": {"active": 1}});
        let pod = json!({"status": {"phase": "Pending", "containerStatuses": [
            {"name": "main", "state": {"waiting": {"reason": "ImagePullBackOff", "message": "not found"}}}
        ]}});
        match status_from_resources(&job, Some(&pod)) {
            JobStatus::Failed { exit_code, reason } => {
                assert_eq!(exit_code, None);
                assert_eq!(reason, "ImagePullBackOff: not found");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_pending_and_running() {
        let job = json!({"status": {"active": 1}});
        assert_eq!(status_from_resources(&job, None), JobStatus::Pending);
        let pod = json!({"status": {"phase": "Running", "containerStatuses": [
            {"name": "main", "state": {"running": {}}}
        ]}});
        assert_eq!(status_from_resources(&job, Some(&pod)), JobStatus::Running);
        assert!(container_started(&pod));
    }

    #[tokio::test]
    async fn test_submit_and_cleanup_against_api() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/apis/batch/v1/namespaces/ns/jobs")
            .match_body(mockito::Matcher::PartialJson(json!({"kind": "Job"})))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/apis/batch/v1/namespaces/ns/jobs/sf-run-node-abc123")
            .match_query(mockito::Matcher::UrlEncoded(
                "propagationPolicy".into(),
                "Background".into(),
            ))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = KubeClient::new(KubeConfig {
            api_server: server.url(),
            token: None,
            ca_cert_pem: None,
        })
        .unwrap();
        let backend = KubernetesJobBackend::new(client, "ns", 60);
        let req = request();
        backend.submit(&req).await.unwrap();
        backend.cleanup(&req.name).await.unwrap();
        create.assert_async().await;
        delete.assert_async().await;
    }
}
