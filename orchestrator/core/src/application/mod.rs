// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod group_runtime;
pub mod job_runner;
pub mod output_protocol;
pub mod runtime_factory;
pub mod tool_discovery;

pub use group_runtime::{GroupRuntime, GroupRuntimeConfig, ProvisionRequest};
pub use job_runner::{JobRunner, JobRunnerConfig, RunOutcome, ServiceHandle};
pub use tool_discovery::{McpToolDiscovery, RetryPolicy};
