//! offsync CLI
//!
//! Command-line interface for offsync - take feature data offline, edit it
//! locally and sync it back.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use offsync_core::{Config, LocalEdit};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Take feature data offline and sync edits back")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mode, local store and pending edits
    Status,
    /// Download the area of interest and work with local data
    Offline {
        /// Area of interest as xmin,ymin,xmax,ymax (defaults to the whole world)
        #[arg(long, allow_hyphen_values = true)]
        extent: Option<String>,
        /// Layer to take offline (repeatable; defaults to the configured layers)
        #[arg(short, long)]
        layer: Vec<u32>,
        /// Download a new replica even if one exists
        #[arg(long)]
        fresh: bool,
    },
    /// Edit the local replica
    Edit {
        #[command(subcommand)]
        command: EditCommands,
    },
    /// Upload pending edits
    Sync,
    /// Switch back to live data
    Online {
        /// Upload pending edits before switching
        #[arg(long, conflicts_with = "discard")]
        sync: bool,
        /// Switch without uploading; edits stay in the local store
        #[arg(long, conflicts_with = "sync")]
        discard: bool,
    },
    /// Delete the local store
    Delete {
        /// Do not ask before deleting unsynced edits
        #[arg(short, long)]
        force: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum EditCommands {
    /// Add a feature
    Add {
        /// Layer id
        layer: u32,
        /// Attributes as a JSON object
        attributes: String,
        /// Geometry as JSON
        #[arg(short, long)]
        geometry: Option<String>,
    },
    /// Update a feature
    Update {
        /// Layer id
        layer: u32,
        /// Feature id
        #[arg(allow_hyphen_values = true)]
        id: i64,
        /// Attributes as a JSON object
        attributes: String,
        /// Geometry as JSON
        #[arg(short, long)]
        geometry: Option<String>,
    },
    /// Delete a feature and its attachments
    #[command(alias = "rm")]
    Delete {
        /// Layer id
        layer: u32,
        /// Feature id
        #[arg(allow_hyphen_values = true)]
        id: i64,
    },
    /// Attach a file to a feature
    Attach {
        /// Layer id
        layer: u32,
        /// Feature id
        #[arg(allow_hyphen_values = true)]
        feature: i64,
        /// File to attach
        file: PathBuf,
        /// MIME type (guessed from the file extension by default)
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Remove an attachment
    Detach {
        /// Layer id
        layer: u32,
        /// Attachment id
        #[arg(allow_hyphen_values = true)]
        id: i64,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, service_url, store_name, layers, use_existing, request_timeout_secs, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work without a usable configuration
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config);

    match cli.command {
        Commands::Status => commands::status::show(&config, &output),
        Commands::Offline {
            extent,
            layer,
            fresh,
        } => commands::offline::run(&config, extent, layer, fresh, &output).await,
        Commands::Edit { command } => {
            let edit = build_edit(command)?;
            commands::edit::apply(&config, edit, &output)
        }
        Commands::Sync => commands::sync::run(&config, &output).await,
        Commands::Online { sync, discard } => {
            commands::online::run(&config, sync, discard, &output).await
        }
        Commands::Delete { force } => commands::delete::run(&config, force, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn build_edit(command: EditCommands) -> Result<LocalEdit> {
    let edit = match command {
        EditCommands::Add {
            layer,
            attributes,
            geometry,
        } => LocalEdit::AddFeature {
            layer,
            attributes: commands::edit::parse_attributes(&attributes)?,
            geometry: commands::edit::parse_geometry(geometry.as_deref())?,
        },
        EditCommands::Update {
            layer,
            id,
            attributes,
            geometry,
        } => LocalEdit::UpdateFeature {
            layer,
            id,
            attributes: commands::edit::parse_attributes(&attributes)?,
            geometry: commands::edit::parse_geometry(geometry.as_deref())?,
        },
        EditCommands::Delete { layer, id } => LocalEdit::DeleteFeature { layer, id },
        EditCommands::Attach {
            layer,
            feature,
            file,
            content_type,
        } => commands::edit::attachment_from_file(layer, feature, &file, content_type)?,
        EditCommands::Detach { layer, id } => LocalEdit::DeleteAttachment { layer, id },
    };
    Ok(edit)
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize file logging
///
/// Logging is only enabled when the OFFSYNC_LOG environment variable is set
/// (e.g. OFFSYNC_LOG=debug). Output goes to the configured log file since
/// stdout belongs to command output.
fn init_logging(config: &Config) {
    let Ok(level) = std::env::var("OFFSYNC_LOG") else {
        return;
    };

    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
        eprintln!("Could not open log file {}", log_path.display());
        return;
    };

    let filter = EnvFilter::new(format!("offsync_core={0},offsync_cli={0}", level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(file)
        .try_init();
}
