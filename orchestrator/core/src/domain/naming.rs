// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Resource naming and labelling
//!
//! Every platform object the runtime creates (containers, cluster jobs,
//! config objects, scratch directories, object-storage prefixes) is named
//! from the tenant and run id and carries the same label set, so an external
//! reaper can find orphans after a process crash.

use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::volume::{RunId, TenantId};

pub const LABEL_MANAGED: &str = "secflow.io/managed";
pub const LABEL_TENANT: &str = "secflow.io/tenant";
pub const LABEL_RUN_ID: &str = "secflow.io/run-id";
pub const LABEL_NODE: &str = "secflow.io/node";
pub const LABEL_JOB: &str = "secflow.io/job";
pub const LABEL_PURPOSE: &str = "secflow.io/purpose";

/// Maximum length of a DNS-1123 label (Kubernetes object names, label values).
pub const MAX_LABEL_LEN: usize = 63;

/// Lowercase, map runs of non-alphanumerics to a single `-`, trim dashes and
/// cut to `max_len`.
pub fn sanitize_dns_label(raw: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_len));
    let mut last_dash = true;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.truncate(max_len);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Random lowercase hex suffix, at most 32 characters.
pub fn random_suffix(len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..len.min(hex.len())].to_string()
}

/// Builds `<prefix>-<part>-<part>-<suffix>` bounded to [`MAX_LABEL_LEN`].
///
/// Parts are consumed left to right; the earlier ones get the budget first,
/// the prefix and suffix are never truncated.
pub fn resource_name(prefix: &str, parts: &[&str], suffix: &str) -> String {
    let mut budget = MAX_LABEL_LEN.saturating_sub(prefix.len() + suffix.len() + 2);
    let mut body: Vec<String> = Vec::new();
    for part in parts {
        let separator = usize::from(!body.is_empty());
        if budget <= separator {
            break;
        }
        let cleaned = sanitize_dns_label(part, budget - separator);
        if cleaned.is_empty() {
            continue;
        }
        budget -= cleaned.len() + separator;
        body.push(cleaned);
    }

    if body.is_empty() {
        format!("{}-{}", prefix, suffix)
    } else {
        format!("{}-{}-{}", prefix, body.join("-"), suffix)
    }
}

/// Label value safe for both container-engine and cluster labels.
pub fn label_value(raw: &str) -> String {
    let value = sanitize_dns_label(raw, MAX_LABEL_LEN);
    if value.is_empty() {
        "none".to_string()
    } else {
        value
    }
}

/// Base label set for anything owned by one run.
pub fn resource_labels(tenant: &TenantId, run_id: &RunId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_TENANT.to_string(), label_value(tenant.as_str())),
        (LABEL_RUN_ID.to_string(), label_value(run_id.as_str())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_dns_label() {
        assert_eq!(sanitize_dns_label("Nuclei_Scan.v2", 63), "nuclei-scan-v2");
        assert_eq!(sanitize_dns_label("--a--b--", 63), "a-b");
        assert_eq!(sanitize_dns_label("abcdef", 3), "abc");
        assert_eq!(sanitize_dns_label("ab-cd", 3), "ab");
    }

    #[test]
    fn test_resource_name_is_bounded() {
        let long = "x".repeat(200);
        let name = resource_name("sf", &[&long, "node"], "abc123");
        assert!(name.len() <= MAX_LABEL_LEN);
        assert!(name.starts_with("sf-x"));
        assert!(name.ends_with("-abc123"));
    }

    #[test]
    fn test_resource_name_skips_empty_parts() {
        assert_eq!(resource_name("sf", &["***", "scan"], "f00"), "sf-scan-f00");
        assert_eq!(resource_name("sf", &[], "f00"), "sf-f00");
    }

    #[test]
    fn test_random_suffix_length() {
        assert_eq!(random_suffix(6).len(), 6);
        assert_ne!(random_suffix(12), random_suffix(12));
    }

    #[test]
    fn test_resource_labels() {
        let labels = resource_labels(&TenantId::new("Acme Corp"), &RunId::new("run_42"));
        assert_eq!(labels[LABEL_MANAGED], "true");
        assert_eq!(labels[LABEL_TENANT], "acme-corp");
        assert_eq!(labels[LABEL_RUN_ID], "run-42");
    }
}
