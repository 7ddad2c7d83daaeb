// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and ports. Nothing in here talks to a container engine, a
//! cluster or the network.

pub mod credentials;
pub mod job;
pub mod naming;
pub mod path_sanitizer;
pub mod registry;
pub mod run_spec;
pub mod runtime;
pub mod runtime_config;
pub mod tool_group;
pub mod volume;
