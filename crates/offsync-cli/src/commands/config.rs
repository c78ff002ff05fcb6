//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use offsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "service_url": config.service_url,
                    "store_name": config.store_name,
                    "layers": config.layers,
                    "use_existing": config.use_existing,
                    "request_timeout_secs": config.request_timeout_secs,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  service_url:          {}",
                config.service_url.as_deref().unwrap_or("(not set)")
            );
            println!("  store_name:           {}", config.store_name);
            println!("  layers:               {}", format_layers(&config.layers));
            println!("  use_existing:         {}", config.use_existing);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply_setting(&mut config, &key, &value)?;
    config.validate()?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Update one key of `config` from its string form
fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let unset = value.is_empty() || value == "none";
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "service_url" => {
            config.service_url = if unset {
                None
            } else {
                Some(value.to_string())
            };
        }
        "store_name" => {
            if unset {
                bail!("store_name cannot be empty");
            }
            config.store_name = value.to_string();
        }
        "layers" => {
            config.layers = if unset {
                Vec::new()
            } else {
                value
                    .split(',')
                    .map(|id| id.trim().parse::<u32>())
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("Invalid layer list: {}", value))?
            };
        }
        "use_existing" => {
            config.use_existing = value
                .parse()
                .with_context(|| format!("Invalid boolean value: {}", value))?;
        }
        "request_timeout_secs" => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("Invalid number of seconds: {}", value))?;
            if secs == 0 {
                bail!("request_timeout_secs must be greater than zero");
            }
            config.request_timeout_secs = secs;
        }
        "log_file" => {
            config.log_file = if unset { None } else { Some(value.into()) };
        }
        _ => {
            bail!(
                "Unknown config key: {}. Valid keys: data_dir, service_url, store_name, layers, use_existing, request_timeout_secs, log_file",
                key
            );
        }
    }
    Ok(())
}

fn format_layers(layers: &[u32]) -> String {
    if layers.is_empty() {
        "(all)".to_string()
    } else {
        layers
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
