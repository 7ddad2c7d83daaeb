// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Tool-server group commands
//!
//! Commands: provision, templates validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::info;

use secflow_runtime::application::group_runtime::ProvisionRequest;
use secflow_runtime::build_execution_runtime;
use secflow_runtime::domain::tool_group::{GroupTemplate, ServerEndpoint};

use super::{load_config, parse_json_arg, run_id_or_generate, tenant_or_default};

#[derive(Subcommand)]
pub enum GroupCommand {
    /// Start, discover and register the enabled servers of a group
    Provision {
        /// Path to the group template YAML file
        #[arg(long, value_name = "FILE")]
        template: PathBuf,

        /// Decrypted credential (JSON string or @file.json)
        #[arg(long, value_name = "CREDENTIAL")]
        credential: String,

        /// Server ids to enable (comma separated)
        #[arg(long, value_delimiter = ',', value_name = "IDS")]
        enable: Vec<String>,

        /// Workflow run id (default: generated)
        #[arg(long)]
        run_id: Option<String>,

        /// Workflow node id of the group
        #[arg(long, default_value = "group")]
        node_id: String,

        /// Tenant owning the run
        #[arg(long, env = "SECFLOW_TENANT")]
        tenant: Option<String>,

        /// Tear the group down right after registration instead of waiting
        /// for Ctrl-C
        #[arg(long)]
        no_wait: bool,
    },

    /// Group template operations
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
}

#[derive(Subcommand)]
pub enum TemplatesCommand {
    /// Validate a group template file
    Validate {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

pub async fn handle_command(command: GroupCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        GroupCommand::Provision {
            template,
            credential,
            enable,
            run_id,
            node_id,
            tenant,
            no_wait,
        } => {
            let template = load_template(&template)?;
            let request = ProvisionRequest {
                tenant: tenant_or_default(tenant),
                run_id: run_id_or_generate(run_id),
                group_instance_id: node_id,
                credential: parse_json_arg(Some(&credential))?,
                enabled_server_ids: enable,
                template,
            };
            provision(request, config_path, no_wait).await
        }
        GroupCommand::Templates {
            command: TemplatesCommand::Validate { file },
        } => validate_template(&file),
    }
}

fn load_template(path: &Path) -> Result<GroupTemplate> {
    GroupTemplate::from_yaml_file(path)
        .with_context(|| format!("Failed to load group template {}", path.display()))
}

async fn provision(request: ProvisionRequest, config_path: Option<PathBuf>, no_wait: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let runtime = build_execution_runtime(&config).context("Failed to initialize execution runtime")?;

    println!(
        "Provisioning group {} from template {} (run {})",
        request.group_instance_id.bold(),
        request.template.slug,
        request.run_id
    );

    let endpoints = runtime
        .groups
        .provision(&request)
        .await
        .context("Group provisioning failed")?;

    if endpoints.is_empty() {
        println!("{}", "No servers enabled".yellow());
        return Ok(());
    }
    print_endpoints(&endpoints);

    if !no_wait {
        println!();
        println!("Servers are running. Press Ctrl-C to tear the group down.");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Interrupt received");
    }

    runtime
        .groups
        .teardown(&request.run_id, &request.group_instance_id, &endpoints)
        .await;
    println!("{}", "✓ Group torn down".green());
    Ok(())
}

fn print_endpoints(endpoints: &[ServerEndpoint]) {
    println!("{}", format!("✓ {} server(s) ready", endpoints.len()).green());
    println!("{:<20} {:<28} {:<14} ENDPOINT", "ID", "NAME", "CONTAINER");
    for ep in endpoints {
        let container = if ep.container_id.is_empty() {
            "(direct)".to_string()
        } else {
            ep.container_id.chars().take(12).collect()
        };
        println!(
            "{:<20} {:<28} {:<14} {}",
            ep.server_id.bold(),
            ep.server_name,
            container,
            ep.endpoint
        );
    }
}

fn validate_template(path: &Path) -> Result<()> {
    println!("Validating group template...");

    let template = load_template(path)?;
    template.validate().context("Group template validation failed")?;

    println!(
        "{}",
        format!("✓ Template '{}' is valid", template.slug).green()
    );
    println!("  Credential contract: {}", template.credential_contract);
    println!("  Default image: {}", template.default_image);
    println!(
        "  Credential mapping: {} variable(s){}",
        template.credential_mapping.entries().len(),
        if template.credential_files {
            ", credential files"
        } else {
            ""
        }
    );
    println!("  Servers:");
    for server in &template.servers {
        let target = match &server.endpoint {
            Some(endpoint) => format!("endpoint {}", endpoint),
            None => format!("{} ({})", server.command, template.image_for(server)),
        };
        println!("    - {} {}: {}", server.id.bold(), server.name, target.dimmed());
    }
    Ok(())
}
