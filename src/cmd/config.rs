//! Configuration view and validation: `loanflow config`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use loanflow::config::{CONFIG_FILE_NAME, Config, ENV_MAX_RETRIES, ENV_OUTPUT_DIR};
use loanflow::flow_config::{FlowToml, StageDef};

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Loanflow Configuration");
            println!("======================");
            println!();

            match &config.config_file {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No {} found; using defaults", CONFIG_FILE_NAME),
            }
            println!();

            let flow = config.flow();
            println!("[retry]");
            println!("  backoff_base_secs = {}", flow.retry.backoff_base_secs);
            match flow.retry.stage_timeout_secs {
                Some(secs) => println!("  stage_timeout_secs = {}", secs),
                None => println!("  stage_timeout_secs = (none)"),
            }
            println!();

            if flow.stages.is_empty() {
                println!("No stages configured.");
            } else {
                println!("Stages:");
                for (i, stage) in flow.stages.iter().enumerate() {
                    let mut extras = Vec::new();
                    if let Some(retries) = stage.max_retries {
                        extras.push(format!("max_retries={}", retries));
                    }
                    if let Some(secs) = stage.timeout_secs {
                        extras.push(format!("timeout={}s", secs));
                    }
                    let extras = if extras.is_empty() {
                        String::new()
                    } else {
                        format!(" ({})", extras.join(", "))
                    };
                    println!(
                        "  {}. {:<16} {} {}{}",
                        i + 1,
                        stage.name,
                        stage.command,
                        stage.args.join(" "),
                        console::style(extras).dim()
                    );
                }
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  output_dir = \"{}\"", config.output_dir.display());
            println!("  max_retries = {}", config.max_retries);
            println!(
                "  ({} and {} override the file)",
                ENV_OUTPUT_DIR, ENV_MAX_RETRIES
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut warnings = config.flow().validate();
            if let Err(e) = config.flow().retry_policy() {
                warnings.push(format!("{:#}", e));
            }

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            cmd_config_init(config.config_file.as_deref())?;
        }
    }

    Ok(())
}

/// Write a starter `loanflow.toml` unless one already exists.
pub fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    if path.exists() {
        println!("{} already exists at {}", CONFIG_FILE_NAME, path.display());
        println!("Delete it first if you want to recreate it.");
        return Ok(());
    }

    let flow = FlowToml {
        stages: vec![StageDef {
            name: "extraction".to_string(),
            command: "echo".to_string(),
            args: vec![r#"{"subject_id": "{subject_id}", "mode": "{mode}"}"#.to_string()],
            max_retries: None,
            timeout_secs: None,
        }],
        ..FlowToml::default()
    };
    flow.save(&path)?;

    println!("Created {} at {}", CONFIG_FILE_NAME, path.display());
    println!();
    println!("You can now customize:");
    println!("  - output_dir, max_retries");
    println!("  - [retry] backoff_base_secs, stage_timeout_secs");
    println!("  - [[stages]] name, command, args, max_retries, timeout_secs");
    println!();
    Ok(())
}
