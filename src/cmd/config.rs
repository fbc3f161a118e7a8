//! Configuration view and validation commands: `listing-pipeline config`.

use anyhow::Result;
use listing_pipeline::config::{CONFIG_FILE_NAME, ENV_MAX_CONCURRENCY, ENV_TIMEOUT_SECS, PipelineToml};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => std::env::current_dir()?.join(CONFIG_FILE_NAME),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, using defaults.", CONFIG_FILE_NAME);
            }
            println!();

            let toml = super::load_config(cli)?;
            println!("[runner]");
            println!("  max_concurrency = {}", toml.runner.max_concurrency);
            println!(
                "  operation_timeout_secs = {}",
                toml.runner.operation_timeout_secs
            );
            println!();
            println!("[plan]");
            match toml.plan.target {
                Some(target) => println!("  target = \"{}\"", target),
                None => println!("  target = (approved)"),
            }
            println!();
            println!(
                "Environment overrides: {}, {}",
                ENV_MAX_CONCURRENCY, ENV_TIMEOUT_SECS
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE_NAME);
                return Ok(());
            }

            let toml = PipelineToml::load(&config_path)?;
            let warnings = toml.validate();
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
            if config_path.exists() {
                println!(
                    "{} already exists at {}",
                    CONFIG_FILE_NAME,
                    config_path.display()
                );
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            PipelineToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
