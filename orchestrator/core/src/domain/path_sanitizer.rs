// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Validates the two kinds of paths that cross the container boundary:
//! volume-relative file paths (keys of a [`VolumeFiles`] map, or paths echoed
//! back by the volume capture section of the output protocol) and absolute
//! mount targets inside the container.
//!
//! Both end up in shell words and in backing-store object keys, so anything
//! that could escape the volume root or break word splitting is rejected here.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Path validation for volume content and mount targets
//!
//! [`VolumeFiles`]: crate::domain::volume::VolumeFiles

use std::path::{Component, Path};
use thiserror::Error;

/// Path sanitization errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Mount target must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

/// Path sanitizer domain service
///
/// # Security Guarantees
/// - Rejects paths containing `..` components
/// - Rejects NUL bytes and ASCII control characters
/// - Relative paths are normalized (`./a//b` becomes `a/b`)
/// - Mount targets may not contain whitespace or `:` (they are word-split by
///   the capture script and used as a field separator in file markers)
pub struct PathSanitizer {
    /// Maximum allowed path length (default: 4096)
    max_path_len: usize,
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_path_len: 4096 }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Normalize a volume-relative file path.
    ///
    /// ```
    /// use secflow_runtime::domain::path_sanitizer::PathSanitizer;
    ///
    /// let sanitizer = PathSanitizer::new();
    /// assert_eq!(sanitizer.relative("./reports//scan.json").unwrap(), "reports/scan.json");
    /// assert!(sanitizer.relative("../etc/passwd").is_err());
    /// assert!(sanitizer.relative("/etc/passwd").is_err());
    /// ```
    pub fn relative(&self, path: &str) -> Result<String, PathSanitizerError> {
        self.check_common(path)?;

        let candidate = Path::new(path);
        let mut parts: Vec<&str> = Vec::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| PathSanitizerError::InvalidPath(path.to_string()))?;
                    parts.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    tracing::warn!(path = %path, "Rejected volume path with '..' component");
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathSanitizerError::InvalidPath(format!(
                        "{} (volume paths must be relative)",
                        path
                    )));
                }
            }
        }

        if parts.is_empty() {
            return Err(PathSanitizerError::InvalidPath(format!(
                "'{}' does not name a file",
                path
            )));
        }

        Ok(parts.join("/"))
    }

    /// Validate an absolute mount target inside the container.
    pub fn mount_target(&self, target: &str) -> Result<String, PathSanitizerError> {
        self.check_common(target)?;

        if !target.starts_with('/') {
            return Err(PathSanitizerError::NotAbsolute(target.to_string()));
        }
        if target.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(PathSanitizerError::InvalidPath(format!(
                "{} (mount targets may not contain whitespace or ':')",
                target
            )));
        }
        if Path::new(target)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(PathSanitizerError::PathTraversal(target.to_string()));
        }

        let trimmed = target.trim_end_matches('/');
        Ok(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
    }

    fn check_common(&self, path: &str) -> Result<(), PathSanitizerError> {
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }
        if path.is_empty() {
            return Err(PathSanitizerError::InvalidPath("empty path".to_string()));
        }
        if path.chars().any(|c| c == '\0' || c.is_control()) {
            return Err(PathSanitizerError::InvalidPath(
                "Path contains control characters".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
