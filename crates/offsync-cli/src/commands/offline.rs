//! Offline command handler

use anyhow::{bail, Result};

use offsync_core::{Config, DownloadOptions, Extent, SyncMode};

use crate::commands::{drive, open_controller};
use crate::output::Output;

/// Download (or reuse) a local replica and switch to local data
pub async fn run(
    config: &Config,
    extent: Option<String>,
    layers: Vec<u32>,
    fresh: bool,
    output: &Output,
) -> Result<()> {
    let extent = match extent {
        Some(value) => value.parse::<Extent>()?,
        None => Extent::world(),
    };
    let mut options = DownloadOptions::from(config);
    if !layers.is_empty() {
        options.layers = layers;
    }
    if fresh {
        options.use_existing = false;
    }

    let mut controller = open_controller(config)?;
    if controller.mode() == SyncMode::Local {
        output.message("Already working with local data.");
        return Ok(());
    }

    let mut events = controller.subscribe();
    controller.go_offline(extent, options)?;
    drive(&mut controller, &mut events, output).await;

    if controller.mode() != SyncMode::Local {
        bail!("Could not take data offline");
    }
    output.success(&format!(
        "Working offline ({} unsynced edit(s))",
        controller.pending_edit_count()
    ));
    Ok(())
}
