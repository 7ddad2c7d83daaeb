// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Kubernetes REST client
//!
//! A thin JSON client over the API server, authenticated with the pod's
//! service-account token. Only the handful of calls the job backend and the
//! ConfigMap volume need are exposed.

pub mod job_backend;

pub use job_backend::{build_job_manifest, KubernetesJobBackend};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::domain::runtime::RuntimeError;
use crate::domain::runtime_config::KubernetesSettings;
use crate::domain::volume::VolumeError;

const IN_CLUSTER_API_SERVER: &str = "https://kubernetes.default.svc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Kubernetes configuration error: {0}")]
    Config(String),

    #[error("Kubernetes API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Kubernetes API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Kubernetes response decode error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KubeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            KubeError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<KubeError> for RuntimeError {
    fn from(e: KubeError) -> Self {
        match e {
            KubeError::Config(msg) => RuntimeError::Configuration(msg),
            other => RuntimeError::container(other.to_string()),
        }
    }
}

impl From<KubeError> for VolumeError {
    fn from(e: KubeError) -> Self {
        VolumeError::Backend(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_server: String,
    pub token: Option<String>,
    pub ca_cert_pem: Option<Vec<u8>>,
}

impl KubeConfig {
    /// Service-account credentials mounted into the pod. The API server
    /// falls back to `KUBERNETES_SERVICE_HOST`/`_PORT`, then the cluster DNS
    /// name.
    pub fn in_cluster(settings: &KubernetesSettings) -> Result<Self, KubeError> {
        let api_server = match &settings.api_server {
            Some(url) => url.clone(),
            None => match (
                std::env::var("KUBERNETES_SERVICE_HOST"),
                std::env::var("KUBERNETES_SERVICE_PORT"),
            ) {
                (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
                _ => IN_CLUSTER_API_SERVER.to_string(),
            },
        };

        let token = std::fs::read_to_string(&settings.token_path)
            .map(|t| t.trim().to_string())
            .map_err(|e| {
                KubeError::Config(format!(
                    "Failed to read service account token {}: {}",
                    settings.token_path, e
                ))
            })?;
        let ca_cert_pem = std::fs::read(&settings.ca_cert_path).ok();

        Ok(Self {
            api_server,
            token: Some(token),
            ca_cert_pem,
        })
    }
}

#[derive(Clone)]
pub struct KubeClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> Result<Self, KubeError> {
        let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| KubeError::Config(format!("invalid cluster CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| KubeError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.api_server.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(req: RequestBuilder) -> Result<reqwest::Response, KubeError> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {}", status));
        Err(KubeError::Api {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, KubeError> {
        let response = Self::send(
            self.request(Method::GET, path)
                .query(query)
                .timeout(REQUEST_TIMEOUT),
        )
        .await?;
        Ok(response.json().await?)
    }

    pub async fn create(&self, path: &str, body: &Value) -> Result<Value, KubeError> {
        let response = Self::send(
            self.request(Method::POST, path)
                .json(body)
                .timeout(REQUEST_TIMEOUT),
        )
        .await?;
        Ok(response.json().await?)
    }

    pub async fn replace(&self, path: &str, body: &Value) -> Result<Value, KubeError> {
        let response = Self::send(
            self.request(Method::PUT, path)
                .json(body)
                .timeout(REQUEST_TIMEOUT),
        )
        .await?;
        Ok(response.json().await?)
    }

    /// Deletes a resource. A missing resource is not an error.
    pub async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<(), KubeError> {
        match Self::send(
            self.request(Method::DELETE, path)
                .query(query)
                .timeout(REQUEST_TIMEOUT),
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, KubeError> {
        let response = Self::send(
            self.request(Method::GET, path)
                .query(query)
                .timeout(REQUEST_TIMEOUT),
        )
        .await?;
        Ok(response.text().await?)
    }

    /// Streams a response body without a total timeout (log follow).
    pub async fn stream(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<BoxStream<'static, Result<Bytes, KubeError>>, KubeError> {
        let response = Self::send(self.request(Method::GET, path).query(query)).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(KubeError::from))
            .boxed())
    }
}

pub(crate) fn is_conflict(e: &KubeError) -> bool {
    e.status() == Some(StatusCode::CONFLICT.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(url: String) -> KubeClient {
        KubeClient::new(KubeConfig {
            api_server: url,
            token: Some("sa-token".into()),
            ca_cert_pem: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/namespaces/jobs/configmaps/cm")
            .match_header("authorization", "Bearer sa-token")
            .with_status(200)
            .with_body(r#"{"metadata":{"name":"cm"}}"#)
            .create_async()
            .await;

        let value: Value = client(server.url())
            .get("/api/v1/namespaces/jobs/configmaps/cm", &[])
            .await
            .unwrap();
        assert_eq!(value["metadata"]["name"], "cm");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_tolerates_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/apis/batch/v1/namespaces/jobs/jobs/gone")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"kind":"Status","reason":"NotFound"}"#)
            .create_async()
            .await;

        client(server.url())
            .delete(
                "/apis/batch/v1/namespaces/jobs/jobs/gone",
                &[("propagationPolicy", "Background")],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_error_keeps_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/apis/batch/v1/namespaces/jobs/jobs")
            .with_status(409)
            .with_body("already exists")
            .create_async()
            .await;

        let err = client(server.url())
            .create("/apis/batch/v1/namespaces/jobs/jobs", &json!({}))
            .await
            .unwrap_err();
        assert!(is_conflict(&err));
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_in_cluster_requires_token() {
        let settings = KubernetesSettings {
            token_path: "/nonexistent/secflow/token".into(),
            ..KubernetesSettings::default()
        };
        assert!(matches!(
            KubeConfig::in_cluster(&settings),
            Err(KubeError::Config(_))
        ));
    }
}
