// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Output Protocol Codec
//!
//! Containers report their structured result and written files purely
//! through their combined log stream, so the runner needs no exec or copy
//! access into the container. Shell-capable commands are wrapped in a small
//! POSIX script that, after the user program exits, prints:
//!
//! ```text
//! ___SECFLOW_RESULT_JSON___
//! <contents of $SECFLOW_OUTPUT_PATH (default /secflow/output/result.json), or {}>
//! ___SECFLOW_VOLUME_CAPTURE___                       (writable mounts only)
//! ___FILE_START___:<mount>:<relative path>
//! <base64 on one line>
//! ___FILE_END___
//! ```
//!
//! and then exits with the user program's exit code.
//!
//! Parsing never fails: output without the result delimiter falls back to
//! the last JSON line of the logs, then to the raw text (`structured = false`).

use base64::Engine;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::domain::volume::VolumeFiles;

pub const RESULT_DELIMITER: &str = "___SECFLOW_RESULT_JSON___";
pub const VOLUME_DELIMITER: &str = "___SECFLOW_VOLUME_CAPTURE___";
pub const FILE_START_MARKER: &str = "___FILE_START___";
pub const FILE_END_MARKER: &str = "___FILE_END___";

pub const INPUT_DIR: &str = "/secflow/input";
pub const OUTPUT_DIR: &str = "/secflow/output";
pub const PARAMS_FILE: &str = "params.json";
pub const RESULT_FILE: &str = "result.json";

pub const WRITABLE_MOUNTS_ENV: &str = "SECFLOW_WRITABLE_MOUNTS";
pub const INPUT_PATH_ENV: &str = "SECFLOW_INPUT_PATH";
pub const OUTPUT_PATH_ENV: &str = "SECFLOW_OUTPUT_PATH";
pub const RUN_ID_ENV: &str = "SECFLOW_RUN_ID";

const SHELLS: &[&str] = &["sh", "bash", "ash", "dash"];
const SHELL_DIRS: &[&str] = &["/bin/", "/usr/bin/", "/usr/local/bin/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapMode {
    /// Shell script embedded in the protocol wrapper.
    Wrapped,
    /// Shell-less image, dynamic-args convention unwrapped to a direct call.
    DynamicArgs,
    /// Left untouched; parsing relies on the heuristic fallback.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedCommand {
    /// `None` keeps the image entrypoint.
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub mode: WrapMode,
}

fn is_shell(arg: &str) -> bool {
    if SHELLS.contains(&arg) {
        return true;
    }
    SHELL_DIRS
        .iter()
        .filter_map(|dir| arg.strip_prefix(dir))
        .any(|name| SHELLS.contains(&name))
}

fn dynamic_args_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^\s*"?([^"\s]+)"?\s+"\$@"\s*$"#).expect("dynamic args pattern is valid")
    })
}

/// Single-quote a word for POSIX sh.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

fn wrapper_script(script: &str, has_writable_volumes: bool) -> String {
    let mut wrapper = format!(
        "set +e\n\
         (\n{script}\n)\n\
         __secflow_exit=$?\n\
         __secflow_result=\"${{{output_env}:-{output_dir}/{result_file}}}\"\n\
         printf '\\n%s\\n' {result_delim}\n\
         if [ -f \"$__secflow_result\" ]; then cat \"$__secflow_result\"; else printf '{{}}'; fi\n\
         printf '\\n'\n",
        script = script,
        output_env = OUTPUT_PATH_ENV,
        output_dir = OUTPUT_DIR,
        result_file = RESULT_FILE,
        result_delim = shell_quote(RESULT_DELIMITER),
    );

    if has_writable_volumes {
        wrapper.push_str(&format!(
            "printf '%s\\n' {volume_delim}\n\
             for __secflow_mount in ${{{mounts_env}}}; do\n\
             \x20 [ -d \"$__secflow_mount\" ] || continue\n\
             \x20 (cd \"$__secflow_mount\" && find . -type f) | while IFS= read -r __secflow_file; do\n\
             \x20   __secflow_rel=\"${{__secflow_file#./}}\"\n\
             \x20   printf '%s:%s:%s\\n' {file_start} \"$__secflow_mount\" \"$__secflow_rel\"\n\
             \x20   base64 < \"$__secflow_mount/$__secflow_rel\" | tr -d '\\n'\n\
             \x20   printf '\\n%s\\n' {file_end}\n\
             \x20 done\n\
             done\n",
            volume_delim = shell_quote(VOLUME_DELIMITER),
            mounts_env = WRITABLE_MOUNTS_ENV,
            file_start = shell_quote(FILE_START_MARKER),
            file_end = shell_quote(FILE_END_MARKER),
        ));
    }

    wrapper.push_str("exit $__secflow_exit\n");
    wrapper
}

/// Rewrites a command so that its result and writable files are reported
/// through stdout.
pub fn wrap_command(
    entrypoint: Option<&[String]>,
    command: &[String],
    has_writable_volumes: bool,
    distroless: bool,
) -> WrappedCommand {
    let passthrough = || WrappedCommand {
        entrypoint: entrypoint.map(<[String]>::to_vec),
        command: command.to_vec(),
        mode: WrapMode::Passthrough,
    };

    let argv: Vec<&String> = entrypoint.unwrap_or_default().iter().chain(command).collect();

    // [shell] -c <script> [args...]
    let (shell, rest) = match argv.as_slice() {
        [first, rest @ ..] if is_shell(first) => (Some(first.as_str()), rest),
        all => (None, all),
    };
    let (script, trailing) = match rest {
        [flag, script, trailing @ ..] if flag.as_str() == "-c" => (script.as_str(), trailing),
        _ => {
            if has_writable_volumes {
                warn!("Command is not shell-wrappable; writable volume capture disabled");
            }
            return passthrough();
        }
    };

    if distroless {
        let Some(captures) = dynamic_args_pattern().captures(script) else {
            warn!("Shell-less image with a shell-form command; passing it through unchanged");
            return passthrough();
        };
        // trailing[0] is the $0 separator, the remainder become "$@".
        let binary = captures[1].to_string();
        let args = trailing.iter().skip(1).map(|s| s.to_string()).collect();
        debug!(binary = %binary, "Unwrapped dynamic-args command for shell-less image");
        return WrappedCommand {
            entrypoint: Some(vec![binary]),
            command: args,
            mode: WrapMode::DynamicArgs,
        };
    }

    let Some(shell) = shell else {
        // `-c <script>` without a shell in front relies on the image entrypoint.
        return passthrough();
    };

    let mut wrapped = vec!["-c".to_string(), wrapper_script(script, has_writable_volumes)];
    wrapped.extend(trailing.iter().map(|s| s.to_string()));
    WrappedCommand {
        entrypoint: Some(vec![shell.to_string()]),
        command: wrapped,
        mode: WrapMode::Wrapped,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub result: Value,
    /// Mount target -> captured files.
    pub files: BTreeMap<String, VolumeFiles>,
    /// `false` when the result came from the heuristic fallback.
    pub structured: bool,
}

fn parse_file_section(section: &str) -> BTreeMap<String, VolumeFiles> {
    let mut files: BTreeMap<String, VolumeFiles> = BTreeMap::new();
    let mut current: Option<(String, String)> = None;
    let mut content = String::new();

    for line in section.lines().map(|l| l.trim_end_matches('\r')) {
        if let Some(header) = line
            .strip_prefix(FILE_START_MARKER)
            .and_then(|h| h.strip_prefix(':'))
        {
            if let Some((mount, _)) = current.take() {
                warn!(mount = %mount, "File block without end marker; discarded");
            }
            current = header
                .split_once(':')
                .map(|(mount, path)| (mount.to_string(), path.to_string()));
            content.clear();
        } else if line == FILE_END_MARKER {
            let Some((mount, path)) = current.take() else {
                continue;
            };
            let bytes = match base64::engine::general_purpose::STANDARD.decode(content.trim()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(mount = %mount, path = %path, error = %e, "Captured file is not valid base64; skipped");
                    continue;
                }
            };
            let mount = mount.trim_end_matches('/').to_string();
            if let Err(e) = files.entry(mount.clone()).or_default().insert(&path, bytes) {
                warn!(mount = %mount, path = %path, error = %e, "Rejected captured file path");
            }
        } else if current.is_some() {
            content.push_str(line.trim());
        }
    }
    files.retain(|_, f| !f.is_empty());
    files
}

fn last_json_line(text: &str) -> Option<Value> {
    text.lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{') || l.starts_with('['))
        .find_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|v| v.is_object() || v.is_array())
}

/// Extracts the result and captured files from a container's logs.
pub fn parse_output(logs: &str) -> ParsedOutput {
    let (text, files) = match logs.rfind(VOLUME_DELIMITER) {
        Some(idx) => (
            &logs[..idx],
            parse_file_section(&logs[idx + VOLUME_DELIMITER.len()..]),
        ),
        None => (logs, BTreeMap::new()),
    };

    if let Some(idx) = text.rfind(RESULT_DELIMITER) {
        let payload = text[idx + RESULT_DELIMITER.len()..].trim();
        match serde_json::from_str::<Value>(payload) {
            Ok(result) => {
                return ParsedOutput {
                    result,
                    files,
                    structured: true,
                }
            }
            Err(e) => warn!(error = %e, "result.json is not valid JSON; falling back to log heuristics"),
        }
    }

    let result = last_json_line(text).unwrap_or_else(|| {
        let raw = match text.rfind(RESULT_DELIMITER) {
            Some(idx) => &text[..idx],
            None => text,
        };
        Value::String(raw.trim().to_string())
    });
    debug!("Parsed container output in heuristic mode");
    ParsedOutput {
        result,
        files,
        structured: false,
    }
}

/// Last `lines` lines of human-readable output, without the file capture
/// section.
pub fn log_tail(logs: &str, lines: usize) -> String {
    let text = match logs.rfind(VOLUME_DELIMITER) {
        Some(idx) => &logs[..idx],
        None => logs,
    };
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wrap_shell_command() {
        let entrypoint = strings(&["/bin/sh"]);
        let wrapped = wrap_command(
            Some(&entrypoint),
            &strings(&["-c", "nuclei -u \"$1\"", "sh", "https://example.com"]),
            false,
            false,
        );
        assert_eq!(wrapped.mode, WrapMode::Wrapped);
        assert_eq!(wrapped.entrypoint, Some(strings(&["/bin/sh"])));
        assert_eq!(wrapped.command[0], "-c");
        assert!(wrapped.command[1].contains("(\nnuclei -u \"$1\"\n)"));
        assert!(wrapped.command[1].contains(RESULT_DELIMITER));
        assert!(wrapped.command[1].contains("${SECFLOW_OUTPUT_PATH:-/secflow/output/result.json}"));
        assert!(!wrapped.command[1].contains(VOLUME_DELIMITER));
        assert!(wrapped.command[1].ends_with("exit $__secflow_exit\n"));
        assert_eq!(&wrapped.command[2..], &strings(&["sh", "https://example.com"])[..]);
    }

    #[test]
    fn test_wrap_shell_in_command_only() {
        let wrapped = wrap_command(None, &strings(&["bash", "-c", "echo hi"]), true, false);
        assert_eq!(wrapped.mode, WrapMode::Wrapped);
        assert_eq!(wrapped.entrypoint, Some(strings(&["bash"])));
        assert!(wrapped.command[1].contains(VOLUME_DELIMITER));
        assert!(wrapped.command[1].contains("${SECFLOW_WRITABLE_MOUNTS}"));
    }

    #[test]
    fn test_dynamic_args_unwrapped_for_distroless() {
        let entrypoint = strings(&["sh"]);
        let wrapped = wrap_command(
            Some(&entrypoint),
            &strings(&["-c", r#""/usr/local/bin/trufflehog" "$@""#, "--", "git", "https://x"]),
            true,
            true,
        );
        assert_eq!(wrapped.mode, WrapMode::DynamicArgs);
        assert_eq!(wrapped.entrypoint, Some(strings(&["/usr/local/bin/trufflehog"])));
        assert_eq!(wrapped.command, strings(&["git", "https://x"]));
    }

    #[test]
    fn test_passthrough() {
        let wrapped = wrap_command(None, &strings(&["nmap", "-sV", "host"]), true, false);
        assert_eq!(wrapped.mode, WrapMode::Passthrough);
        assert_eq!(wrapped.entrypoint, None);
        assert_eq!(wrapped.command, strings(&["nmap", "-sV", "host"]));

        let entrypoint = strings(&["sh"]);
        let wrapped = wrap_command(Some(&entrypoint), &strings(&["-c", "echo hi | jq ."]), false, true);
        assert_eq!(wrapped.mode, WrapMode::Passthrough);
    }

    #[test]
    fn test_shell_detection() {
        assert!(is_shell("sh"));
        assert!(is_shell("/usr/bin/bash"));
        assert!(is_shell("/bin/ash"));
        assert!(!is_shell("/opt/sh"));
        assert!(!is_shell("zsh"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn test_parse_structured_result_with_noise() {
        let logs = format!(
            "starting scan\n{{\"not\": \"this\"}}\nWARN: slow target\n\n{}\n{{\"findings\": 3}}\n",
            RESULT_DELIMITER
        );
        let parsed = parse_output(&logs);
        assert!(parsed.structured);
        assert_eq!(parsed.result, json!({"findings": 3}));
        assert!(parsed.files.is_empty());
    }

    #[test]
    fn test_parse_uses_last_result_delimiter() {
        let logs = format!(
            "{d}\n{{\"a\": 1}}\nmore noise\n{d}\n[1, 2]\n",
            d = RESULT_DELIMITER
        );
        assert_eq!(parse_output(&logs).result, json!([1, 2]));
    }

    #[test]
    fn test_parse_files() {
        let logs = format!(
            "{r}\n{{}}\n{v}\n{s}:/data/out:reports/a.txt\naGVsbG8=\n{e}\n{s}:/data/out:b.bin\n\n{e}\n{s}:/data/out:../evil\naGk=\n{e}\n",
            r = RESULT_DELIMITER,
            v = VOLUME_DELIMITER,
            s = FILE_START_MARKER,
            e = FILE_END_MARKER
        );
        let parsed = parse_output(&logs);
        assert!(parsed.structured);
        assert_eq!(parsed.result, json!({}));
        let out = &parsed.files["/data/out"];
        assert_eq!(out.get_text("reports/a.txt").as_deref(), Some("hello"));
        assert_eq!(out.get("b.bin"), Some(&b""[..]));
        assert_eq!(out.len(), 2, "traversal path must be dropped");
    }

    #[test]
    fn test_parse_heuristic_json_line() {
        let parsed = parse_output("line one\n{\"status\":\"ok\"}\ntrailing text\n");
        assert!(!parsed.structured);
        assert_eq!(parsed.result, json!({"status": "ok"}));
    }

    #[test]
    fn test_parse_invalid_result_falls_back() {
        let logs = format!("[\"from log\"]\n{}\n{{broken\n", RESULT_DELIMITER);
        let parsed = parse_output(&logs);
        assert!(!parsed.structured);
        assert_eq!(parsed.result, json!(["from log"]));
    }

    #[test]
    fn test_parse_raw_text() {
        let parsed = parse_output("  plain output\nno json here \n");
        assert!(!parsed.structured);
        assert_eq!(parsed.result, json!("plain output\nno json here"));
    }

    #[test]
    fn test_log_tail_skips_capture_section() {
        let logs = format!("a\nb\nc\n{}\n{}:/x:f\nAAAA\n", VOLUME_DELIMITER, FILE_START_MARKER);
        assert_eq!(log_tail(&logs, 2), "b\nc");
        assert_eq!(log_tail("only", 10), "only");
    }
}
