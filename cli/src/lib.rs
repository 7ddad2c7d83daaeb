// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! SecFlow CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Command handlers over the execution runtime

pub mod commands;
