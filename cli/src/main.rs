// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # SecFlow Execution Runtime CLI
//!
//! The `secflow` binary drives the execution runtime directly, without the
//! workflow engine in front of it. Useful for exercising run specs and group
//! templates against a local Docker engine or a cluster.
//!
//! ## Commands
//!
//! - `secflow run --spec <yaml>` - Execute one container job and print its result
//! - `secflow group provision|templates` - Tool-server groups
//! - `secflow config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use secflow_cli::commands::{self, ConfigCommand, GroupCommand, RunArgs};

/// SecFlow execution runtime - isolated container jobs and MCP tool servers
#[derive(Parser)]
#[command(name = "secflow")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SECFLOW_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SECFLOW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(
        long,
        global = true,
        env = "SECFLOW_LOG_FORMAT",
        value_enum,
        default_value = "compact"
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one run spec as an isolated container job
    #[command(name = "run")]
    Run(RunArgs),

    /// Tool-server group operations
    #[command(name = "group")]
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Some(Commands::Run(args)) => commands::run::handle_command(args, cli.config).await,
        Some(Commands::Group { command }) => {
            commands::group::handle_command(command, cli.config).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}
