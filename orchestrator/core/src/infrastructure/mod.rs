// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod docker;
pub mod kubernetes;
pub mod mcp_client;
pub mod registry_client;
pub mod volume;

pub use docker::DockerJobBackend;
pub use kubernetes::{KubeClient, KubeConfig, KubernetesJobBackend};
pub use registry_client::{BackendRegistryClient, InMemoryToolRegistry};
