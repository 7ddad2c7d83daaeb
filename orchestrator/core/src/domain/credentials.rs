// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Credential Mapper
//!
//! Pure translation of a decrypted credential document into the environment
//! variables (and, for cloud SDKs that only read credential files, the files)
//! a tool server container expects.
//!
//! A [`CredentialMapping`] is written in templates as a plain map:
//!
//! ```yaml
//! credential_mapping:
//!   GITHUB_TOKEN: token
//!   GITHUB_HOST: host?        # optional
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::runtime::RuntimeError;
use crate::domain::volume::{VolumeError, VolumeFiles};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub env_var: String,
    pub field: String,
    pub required: bool,
}

/// Env var -> credential field table. A trailing `?` on the field marks it
/// optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct CredentialMapping(Vec<MappingEntry>);

impl CredentialMapping {
    pub fn entries(&self) -> &[MappingEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for CredentialMapping {
    fn from(raw: BTreeMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .map(|(env_var, field)| match field.strip_suffix('?') {
                    Some(optional) => MappingEntry {
                        env_var,
                        field: optional.to_string(),
                        required: false,
                    },
                    None => MappingEntry {
                        env_var,
                        field,
                        required: true,
                    },
                })
                .collect(),
        )
    }
}

impl From<CredentialMapping> for BTreeMap<String, String> {
    fn from(mapping: CredentialMapping) -> Self {
        mapping
            .0
            .into_iter()
            .map(|e| {
                let field = if e.required { e.field } else { format!("{}?", e.field) };
                (e.env_var, field)
            })
            .collect()
    }
}

fn lookup<'a>(credential: &'a serde_json::Map<String, Value>, field: &str) -> Option<&'a Value> {
    let value = match credential.get(field) {
        Some(v) => Some(v),
        None if field.contains('.') => {
            let mut parts = field.split('.');
            let first = parts.next()?;
            parts.try_fold(credential.get(first)?, |v, part| v.get(part))
        }
        None => None,
    };
    value.filter(|v| !v.is_null())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Map a credential object to environment variables.
///
/// Fields are looked up by exact key first, then as a dotted path into
/// nested objects. `null` counts as missing.
pub fn map_to_env(
    credential: &Value,
    mapping: &CredentialMapping,
) -> Result<BTreeMap<String, String>, RuntimeError> {
    let object = credential.as_object().ok_or_else(|| {
        RuntimeError::Configuration("credential must be a JSON object".to_string())
    })?;

    let mut env = BTreeMap::new();
    for entry in mapping.entries() {
        match lookup(object, &entry.field) {
            Some(value) => {
                env.insert(entry.env_var.clone(), render(value));
            }
            None if entry.required => {
                return Err(RuntimeError::Configuration(format!(
                    "credential is missing required field '{}' (mapped to {})",
                    entry.field, entry.env_var
                )));
            }
            None => {
                tracing::debug!(field = %entry.field, env_var = %entry.env_var, "Optional credential field absent");
            }
        }
    }
    Ok(env)
}

/// Credential files to be mounted read-only, plus the env vars that point
/// SDKs at them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFiles {
    pub files: VolumeFiles,
    env_paths: BTreeMap<String, String>,
}

impl CredentialFiles {
    /// Env vars for the files once mounted at `mount_path`.
    pub fn env(&self, mount_path: &str) -> BTreeMap<String, String> {
        let base = mount_path.trim_end_matches('/');
        self.env_paths
            .iter()
            .map(|(var, file)| (var.clone(), format!("{}/{}", base, file)))
            .collect()
    }
}

fn first_string<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| object.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Render the AWS shared credentials/config files when the credential has the
/// AWS access key shape. Returns `None` for any other shape.
pub fn map_to_files(credential: &Value) -> Result<Option<CredentialFiles>, RuntimeError> {
    let Some(object) = credential.as_object() else {
        return Ok(None);
    };

    let access_key = first_string(object, &["accessKeyId", "access_key_id", "aws_access_key_id"]);
    let secret_key = first_string(
        object,
        &["secretAccessKey", "secret_access_key", "aws_secret_access_key"],
    );
    let (Some(access_key), Some(secret_key)) = (access_key, secret_key) else {
        return Ok(None);
    };
    let session_token = first_string(object, &["sessionToken", "session_token", "aws_session_token"]);
    let region = first_string(object, &["region", "aws_region"]);

    let mut credentials = format!(
        "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\n",
        access_key, secret_key
    );
    if let Some(token) = session_token {
        credentials.push_str(&format!("aws_session_token = {}\n", token));
    }

    let mut config = String::from("[default]\n");
    if let Some(region) = region {
        config.push_str(&format!("region = {}\n", region));
    }
    config.push_str("output = json\n");

    let files = VolumeFiles::from_text([
        ("credentials", credentials.as_str()),
        ("config", config.as_str()),
    ])
    .map_err(|e: VolumeError| RuntimeError::Configuration(e.to_string()))?;

    Ok(Some(CredentialFiles {
        files,
        env_paths: BTreeMap::from([
            ("AWS_SHARED_CREDENTIALS_FILE".to_string(), "credentials".to_string()),
            ("AWS_CONFIG_FILE".to_string(), "config".to_string()),
        ]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(pairs: &[(&str, &str)]) -> CredentialMapping {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn test_required_and_optional_fields() {
        let mapping = mapping(&[("API_TOKEN", "token"), ("API_HOST", "host?")]);

        let env = map_to_env(&json!({"token": "abc"}), &mapping).unwrap();
        assert_eq!(env.get("API_TOKEN").map(String::as_str), Some("abc"));
        assert!(!env.contains_key("API_HOST"));

        let err = map_to_env(&json!({"host": "h"}), &mapping).unwrap_err();
        match err {
            RuntimeError::Configuration(msg) => {
                assert!(msg.contains("'token'"));
                assert!(msg.contains("API_TOKEN"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_value_rendering() {
        let mapping = mapping(&[
            ("PORT", "port"),
            ("VERIFY", "verify"),
            ("SCOPES", "scopes"),
            ("NESTED", "auth.user"),
            ("EMPTY", "nothing?"),
        ]);
        let env = map_to_env(
            &json!({
                "port": 8443,
                "verify": false,
                "scopes": ["repo", "read:org"],
                "auth": {"user": "bot"},
                "nothing": null
            }),
            &mapping,
        )
        .unwrap();
        assert_eq!(env["PORT"], "8443");
        assert_eq!(env["VERIFY"], "false");
        assert_eq!(env["SCOPES"], r#"["repo","read:org"]"#);
        assert_eq!(env["NESTED"], "bot");
        assert!(!env.contains_key("EMPTY"));
    }

    #[test]
    fn test_null_required_field_is_missing() {
        let mapping = mapping(&[("TOKEN", "token")]);
        assert!(map_to_env(&json!({"token": null}), &mapping).is_err());
    }

    #[test]
    fn test_non_object_credential_rejected() {
        let mapping = mapping(&[("TOKEN", "token")]);
        assert!(matches!(
            map_to_env(&json!("secret"), &mapping),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_mapping_serde_roundtrip_keeps_optional_marker() {
        let parsed: CredentialMapping =
            serde_yaml::from_str("A: token\nB: region?\n").unwrap();
        assert_eq!(parsed.entries().len(), 2);
        assert!(!parsed.entries()[1].required);
        let back = serde_yaml::to_string(&parsed).unwrap();
        assert!(back.contains("region?"));
    }

    #[test]
    fn test_aws_files() {
        let files = map_to_files(&json!({
            "accessKeyId": "AKIA123",
            "secretAccessKey": "s3cr3t",
            "sessionToken": "tok",
            "region": "eu-west-1"
        }))
        .unwrap()
        .expect("aws shape");

        let creds = files.files.get_text("credentials").unwrap();
        assert!(creds.starts_with("[default]\n"));
        assert!(creds.contains("aws_access_key_id = AKIA123"));
        assert!(creds.contains("aws_secret_access_key = s3cr3t"));
        assert!(creds.contains("aws_session_token = tok"));
        let config = files.files.get_text("config").unwrap();
        assert!(config.contains("region = eu-west-1"));

        let env = files.env("/secflow/credentials/");
        assert_eq!(env["AWS_SHARED_CREDENTIALS_FILE"], "/secflow/credentials/credentials");
        assert_eq!(env["AWS_CONFIG_FILE"], "/secflow/credentials/config");
    }

    #[test]
    fn test_unrecognized_shape_has_no_files() {
        assert!(map_to_files(&json!({"token": "x"})).unwrap().is_none());
        assert!(map_to_files(&json!({"accessKeyId": "only-half"})).unwrap().is_none());
        assert!(map_to_files(&json!(42)).unwrap().is_none());
    }
}
