// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! SecFlow Execution Runtime
//!
//! Runs workflow steps as isolated, ephemeral container jobs and provisions
//! groups of MCP tool servers for AI agent nodes.
//!
//! # Architecture
//!
//! - **domain:** value types, state machines and the trait seams
//!   ([`JobBackend`](domain::runtime::JobBackend),
//!   [`IsolatedVolume`](domain::volume::IsolatedVolume),
//!   [`ToolDiscovery`](domain::tool_group::ToolDiscovery),
//!   [`ToolRegistry`](domain::registry::ToolRegistry))
//! - **application:** job runner, output protocol, group runtime, factory
//! - **infrastructure:** Docker, Kubernetes, volume backends, MCP and
//!   registry clients

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::job_runner::{JobRunner, RunOutcome, ServiceHandle};
pub use application::runtime_factory::{build_execution_runtime, ExecutionRuntime};
pub use domain::runtime::{ExecutionContext, RuntimeError};
