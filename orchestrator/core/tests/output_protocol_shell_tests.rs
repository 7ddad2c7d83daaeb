// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Runs wrapped commands through the host's /bin/sh and parses what they
//! print, the same way a container's logs are parsed after a job.

#![cfg(unix)]

use serde_json::json;
use tempfile::TempDir;
use tokio::process::Command;

use secflow_runtime::application::output_protocol::{
    parse_output, wrap_command, WrapMode, OUTPUT_PATH_ENV, WRITABLE_MOUNTS_ENV,
};
use secflow_runtime::domain::volume::{
    IsolatedVolume, RunId, TenantId, VolumeFiles, VolumeScope,
};
use secflow_runtime::infrastructure::volume::LocalVolume;

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// Execute a wrapped command on the host; returns (exit code, stdout).
async fn run_wrapped(command: &[String], writable: Option<&str>) -> (i32, String) {
    run_wrapped_with_env(command, writable, &[]).await
}

async fn run_wrapped_with_env(
    command: &[String],
    writable: Option<&str>,
    env: &[(&str, &str)],
) -> (i32, String) {
    let wrapped = wrap_command(None, command, writable.is_some(), false);
    assert_eq!(wrapped.mode, WrapMode::Wrapped);

    let entrypoint = wrapped.entrypoint.expect("wrapped commands set an entrypoint");
    let mut cmd = Command::new(&entrypoint[0]);
    cmd.args(&entrypoint[1..])
        .args(&wrapped.command)
        .env_remove(OUTPUT_PATH_ENV)
        .envs(env.iter().copied());
    if let Some(mounts) = writable {
        cmd.env(WRITABLE_MOUNTS_ENV, mounts);
    }
    let output = cmd.output().await.expect("failed to spawn shell");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

#[tokio::test]
async fn test_missing_result_file_reports_empty_object() {
    let (code, stdout) = run_wrapped(&argv(&["/bin/sh", "-c", "echo scanning"]), None).await;
    assert_eq!(code, 0);

    let parsed = parse_output(&stdout);
    assert!(parsed.structured);
    assert_eq!(parsed.result, json!({}));
    assert!(parsed.files.is_empty());
    assert!(stdout.starts_with("scanning\n"));
}

#[tokio::test]
async fn test_exit_code_is_preserved() {
    let (code, stdout) = run_wrapped(&argv(&["sh", "-c", "echo failing >&2; exit 3"]), None).await;
    assert_eq!(code, 3);
    assert!(parse_output(&stdout).structured);
}

#[tokio::test]
async fn test_positional_arguments_survive_wrapping() {
    let (code, stdout) = run_wrapped(
        &argv(&["sh", "-c", "echo \"target=$1\"", "scan", "example.com"]),
        None,
    )
    .await;
    assert_eq!(code, 0);
    assert!(stdout.contains("target=example.com"));
}

#[tokio::test]
async fn test_writable_mount_files_are_captured() {
    let mount = TempDir::new().unwrap();
    let mount_path = mount.path().to_string_lossy().into_owned();
    std::fs::write(mount.path().join("seed.txt"), "seed").unwrap();

    let script = format!(
        "mkdir -p '{dir}/reports' && printf 'line one\\nline two\\n' > '{dir}/reports/out.txt'",
        dir = mount_path
    );
    let (code, stdout) = run_wrapped(&argv(&["sh", "-c", &script]), Some(&mount_path)).await;
    assert_eq!(code, 0);

    let parsed = parse_output(&stdout);
    assert!(parsed.structured);
    let files = parsed
        .files
        .get(mount_path.trim_end_matches('/'))
        .expect("mount was not captured");
    assert_eq!(files.len(), 2);
    assert_eq!(files.get_text("seed.txt").as_deref(), Some("seed"));
    assert_eq!(
        files.get_text("reports/out.txt").as_deref(),
        Some("line one\nline two\n")
    );
}

#[tokio::test]
async fn test_missing_writable_mount_is_skipped() {
    let (code, stdout) = run_wrapped(
        &argv(&["sh", "-c", "true"]),
        Some("/nonexistent/secflow/mount"),
    )
    .await;
    assert_eq!(code, 0);
    let parsed = parse_output(&stdout);
    assert!(parsed.structured);
    assert!(parsed.files.is_empty());
}

#[tokio::test]
async fn test_result_file_is_reported_verbatim() {
    let out = TempDir::new().unwrap();
    let result_path = out.path().join("result.json");
    let result_env = result_path.to_string_lossy().into_owned();

    let (code, stdout) = run_wrapped_with_env(
        &argv(&["sh", "-c", "echo noise; echo '{\"a\":1}' > \"$SECFLOW_OUTPUT_PATH\""]),
        None,
        &[(OUTPUT_PATH_ENV, &result_env)],
    )
    .await;
    assert_eq!(code, 0);
    let parsed = parse_output(&stdout);
    assert!(parsed.structured);
    assert_eq!(parsed.result, json!({"a": 1}));
}

#[tokio::test]
async fn test_result_file_without_trailing_newline() {
    let out = TempDir::new().unwrap();
    let result_env = out.path().join("result.json").to_string_lossy().into_owned();
    let mount = TempDir::new().unwrap();
    let mount_path = mount.path().to_string_lossy().into_owned();

    let (code, stdout) = run_wrapped_with_env(
        &argv(&[
            "sh",
            "-c",
            "printf '{\"hosts\":[\"a\",\"b\"]}' > \"$SECFLOW_OUTPUT_PATH\"; echo x > \"$1/marker.txt\"; exit 4",
            "scan",
            &mount_path,
        ]),
        Some(&mount_path),
        &[(OUTPUT_PATH_ENV, &result_env)],
    )
    .await;
    assert_eq!(code, 4);
    let parsed = parse_output(&stdout);
    assert!(parsed.structured);
    assert_eq!(parsed.result, json!({"hosts": ["a", "b"]}));
    assert_eq!(
        parsed.files[mount_path.trim_end_matches('/')].get_text("marker.txt").as_deref(),
        Some("x\n")
    );
}

#[tokio::test]
async fn test_volume_round_trip_through_wrapper() {
    let base = TempDir::new().unwrap();
    let scope = |label: &str| VolumeScope::new(TenantId::new("acme"), RunId::new("run-7"), label);

    // Binary content survives the base64 capture unchanged.
    let content: Vec<u8> = vec![0x00, 0x9f, 0xff, b'\n', b'o', b'k'];
    let mut seed = VolumeFiles::new();
    seed.insert("f.txt", content.clone()).unwrap();
    let input = LocalVolume::new(base.path(), scope("input"));
    input.initialize(seed).await.unwrap();
    let input_path = input.path().to_string_lossy().into_owned();

    // Writable scratch the program writes into, as an emptyDir would be.
    let scratch = TempDir::new().unwrap();
    let scratch_path = scratch.path().to_string_lossy().into_owned();

    let (code, stdout) = run_wrapped(
        &argv(&[
            "sh",
            "-c",
            "mkdir -p \"$2/copies\" && cp \"$1/f.txt\" \"$2/copies/f.txt\"",
            "copy",
            &input_path,
            &scratch_path,
        ]),
        Some(&scratch_path),
    )
    .await;
    assert_eq!(code, 0);

    let parsed = parse_output(&stdout);
    let captured = parsed
        .files
        .get(scratch_path.trim_end_matches('/'))
        .expect("scratch mount was not captured");
    assert_eq!(captured.get("copies/f.txt"), Some(&content[..]));

    let output = LocalVolume::new(base.path(), scope("output"));
    output.initialize(VolumeFiles::new()).await.unwrap();
    output.write_back(captured).await.unwrap();

    let files = output.read_files().await.unwrap().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files.get("copies/f.txt"), Some(&content[..]));

    input.cleanup().await;
    output.cleanup().await;
}
