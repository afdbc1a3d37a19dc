//! Configuration view and validation commands: `thinktank config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use thinktank::config::{ThinktankConfig, ThinktankToml};

fn print_toml(toml: &ThinktankToml) {
    println!("[provider]");
    println!("  base_url = \"{}\"", toml.provider.base_url);
    println!(
        "  api_key = {}",
        if toml.provider.api_key.is_some() {
            "(set)"
        } else {
            "(not set)"
        }
    );
    println!();

    println!("[models]");
    println!("  agents = {:?}", toml.models.agents);
    println!("  synthesis = \"{}\"", toml.models.synthesis);
    println!("  review = \"{}\"", toml.models.review);
    if !toml.models.labels.is_empty() {
        println!("  [models.labels]");
        for (id, label) in &toml.models.labels {
            println!("    \"{}\" = \"{}\"", id, label);
        }
    }
    println!();

    println!("[retry]");
    println!("  enabled = {}", toml.retry.enabled);
    println!("  threshold = {}", toml.retry.threshold);
    println!();

    println!("[history]");
    println!("  max_runs = {}", toml.history.max_runs);
    println!("  fallback_runs = {}", toml.history.fallback_runs);
    if let Some(capacity) = toml.history.capacity_bytes {
        println!("  capacity_bytes = {}", capacity);
    }
    println!();
}

pub fn cmd_config(config: &ThinktankConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Thinktank Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No thinktank.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml);

            // Effective values include env overrides.
            println!("Effective values (with env/CLI overrides):");
            println!("  base_url = \"{}\"", config.base_url());
            println!(
                "  api_key = {}",
                if config.api_key().is_some() {
                    "(set)"
                } else {
                    "(not set)"
                }
            );
            println!("  attempts per request = {}", config.retry().attempts());
            println!();
            if !config_path.exists() {
                println!("Run 'thinktank config init' to create a thinktank.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No thinktank.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
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
                println!("thinktank.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.data_dir).with_context(|| {
                format!("Failed to create data directory: {}", config.data_dir.display())
            })?;
            ThinktankToml::default().save(&config_path)?;

            println!("Created thinktank.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [provider] base_url, api_key");
            println!("  - [models] agents, synthesis, review and extra labels");
            println!("  - [retry] and [history] limits");
            println!();
        }
    }

    Ok(())
}
