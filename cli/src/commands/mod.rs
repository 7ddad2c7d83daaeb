// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the SecFlow CLI

pub mod config;
pub mod group;
pub mod run;

pub use self::config::ConfigCommand;
pub use self::group::GroupCommand;
pub use self::run::RunArgs;

use anyhow::{Context, Result};
use std::path::PathBuf;

use secflow_runtime::domain::runtime_config::RuntimeConfigManifest;
use secflow_runtime::domain::volume::{RunId, TenantId};

/// Parse a JSON argument given inline or as `@file.json`.
pub fn parse_json_arg(input: Option<&str>) -> Result<serde_json::Value> {
    match input {
        None => Ok(serde_json::json!({})),
        Some(s) if s.starts_with('@') => {
            let path = &s[1..];
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read JSON file: {}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON from {}", path))
        }
        Some(s) => serde_json::from_str(s).context("Failed to parse JSON argument"),
    }
}

pub(crate) fn load_config(config_path: Option<PathBuf>) -> Result<RuntimeConfigManifest> {
    RuntimeConfigManifest::load_or_default(config_path).context("Failed to load configuration")
}

pub(crate) fn run_id_or_generate(run_id: Option<String>) -> RunId {
    RunId::new(run_id.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4().simple())))
}

pub(crate) fn tenant_or_default(tenant: Option<String>) -> TenantId {
    tenant.map(TenantId::new).unwrap_or_else(TenantId::default_tenant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_json_arg_inline_and_file() {
        assert_eq!(parse_json_arg(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_json_arg(Some(r#"{"target":"example.com"}"#)).unwrap()["target"],
            "example.com"
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"token": "abc"}}"#).unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(parse_json_arg(Some(&arg)).unwrap()["token"], "abc");

        assert!(parse_json_arg(Some("not json")).is_err());
        assert!(parse_json_arg(Some("@/nonexistent/secflow.json")).is_err());
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        let a = run_id_or_generate(None);
        let b = run_id_or_generate(None);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("cli-"));
        assert_eq!(run_id_or_generate(Some("run-1".into())).as_str(), "run-1");
    }
}
