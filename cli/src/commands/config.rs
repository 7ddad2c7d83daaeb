// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use secflow_runtime::domain::runtime_config::{
    RuntimeConfigManifest, VolumeBackendConfig, CONFIG_PATH_ENV,
};

use super::load_config;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./secflow-config.yaml)
        #[arg(short, long, default_value = "./secflow-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = load_config(config_override.clone())?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./secflow-config.yaml");
        println!("  4. ~/.secflow/config.yaml");
        println!("  5. /etc/secflow/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", config.to_yaml_string().context("Failed to render configuration")?);
        return Ok(());
    }

    print_summary(&config);
    Ok(())
}

fn print_summary(config: &RuntimeConfigManifest) {
    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Execution:".bold());
    println!("  Mode: {:?}", spec.execution.mode);
    println!("  Image pull policy: {}", spec.execution.image_pull_policy.as_str());
    println!("  Default timeout: {:?}", spec.execution.default_timeout);
    println!("  Poll interval: {:?}", spec.execution.poll_interval);
    println!();

    println!("{}", "Volumes:".bold());
    match &spec.volumes {
        VolumeBackendConfig::Local { base_path } => {
            println!("  Backend: local ({})", base_path.display())
        }
        VolumeBackendConfig::ConfigMap => {
            println!("  Backend: config_map (namespace {})", spec.kubernetes.namespace)
        }
        VolumeBackendConfig::ObjectStore {
            filer_url,
            root,
            driver,
        } => println!(
            "  Backend: object_store ({}, root /{}, driver {})",
            filer_url, root, driver
        ),
    }
    println!();

    println!("{}", "Tool registry:".bold());
    match &spec.backend.base_url {
        Some(url) => println!("  Backend URL: {}", url),
        None => println!("  Backend URL: {}", "(not set, in-process registry)".dimmed()),
    }
    println!(
        "  Internal token: {}",
        if spec.backend.internal_token.is_some() {
            "set".to_string()
        } else {
            "(not set)".dimmed().to_string()
        }
    );
    println!();

    println!("{}", "Groups:".bold());
    println!("  Service port: {}", spec.groups.service_port);
    println!("  Max parallel starts: {}", spec.groups.max_parallel);
    println!(
        "  Discovery: {} attempt(s), backoff {:?}..{:?}",
        spec.discovery.max_attempts, spec.discovery.initial_backoff, spec.discovery.max_backoff
    );
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = load_config(config_path)?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
