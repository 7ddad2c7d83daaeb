// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! `secflow run` - execute one run spec as an isolated container job

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use secflow_runtime::domain::job::JobName;
use secflow_runtime::domain::run_spec::RunSpec;
use secflow_runtime::domain::runtime::{ExecutionContext, LogSink, RuntimeError};
use secflow_runtime::{build_execution_runtime, RunOutcome};

use super::{load_config, parse_json_arg, run_id_or_generate, tenant_or_default};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the run spec YAML file
    #[arg(long, value_name = "FILE")]
    pub spec: PathBuf,

    /// Input parameters (JSON string or @file.json)
    #[arg(short, long, value_name = "PARAMS")]
    pub params: Option<String>,

    /// Workflow run id (default: generated)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Workflow node id of the step
    #[arg(long, default_value = "cli")]
    pub node_id: String,

    /// Tenant owning the run
    #[arg(long, env = "SECFLOW_TENANT")]
    pub tenant: Option<String>,

    /// Print container output while the job runs
    #[arg(short, long)]
    pub follow: bool,

    /// Print only the result JSON
    #[arg(long)]
    pub json: bool,
}

/// Writes container output to stderr as it arrives.
struct ConsoleLogSink;

impl LogSink for ConsoleLogSink {
    fn emit(&self, _job: &JobName, chunk: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "{}", chunk.dimmed());
        let _ = stderr.flush();
    }
}

pub async fn handle_command(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let spec = RunSpec::from_yaml_file(&args.spec)
        .with_context(|| format!("Failed to load run spec {}", args.spec.display()))?;
    spec.validate().context("Invalid run spec")?;
    let params = parse_json_arg(args.params.as_deref())?;

    let config = load_config(config_path)?;
    let runtime = build_execution_runtime(&config).context("Failed to initialize execution runtime")?;

    let mut ctx = ExecutionContext::new(
        tenant_or_default(args.tenant),
        run_id_or_generate(args.run_id),
        args.node_id,
    );
    if args.follow {
        ctx = ctx.with_log_sink(Arc::new(ConsoleLogSink));
    }

    if !args.json {
        println!(
            "Running {} (run {}, node {})",
            spec.image.bold(),
            ctx.run_id,
            ctx.node_ref
        );
    }

    match runtime.runner.run(&spec, &params, &ctx).await {
        Ok(outcome) if args.json => {
            println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            Ok(())
        }
        Ok(outcome) => {
            print_outcome(&outcome)?;
            Ok(())
        }
        Err(e) => {
            print_failure(&e);
            Err(e).context("Container job failed")
        }
    }
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    println!(
        "{}",
        format!("✓ Job {} succeeded (exit code {})", outcome.job_name, outcome.exit_code).green()
    );
    if !outcome.structured {
        println!(
            "{}",
            "⚠ No structured result found; result was recovered from the logs".yellow()
        );
    }
    for (mount, files) in &outcome.files {
        println!("  Captured {} file(s) from {}", files.len(), mount);
    }
    println!();
    println!("{}", "Result:".bold());
    println!("{}", serde_json::to_string_pretty(&outcome.result)?);
    Ok(())
}

fn print_failure(error: &RuntimeError) {
    eprintln!("{}", format!("✗ {}", error).red());
    if let Some(tail) = error.log_tail().filter(|t| !t.is_empty()) {
        eprintln!("{}", "Last container output:".bold());
        for line in tail.lines() {
            eprintln!("  {}", line.dimmed());
        }
    }
    if error.is_retryable() {
        eprintln!("{}", "The step may succeed if retried.".yellow());
    }
}
