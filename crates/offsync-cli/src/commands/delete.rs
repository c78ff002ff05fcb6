//! Delete command handler

use std::io::{self, Write};

use anyhow::{bail, Result};

use offsync_core::Config;

use crate::commands::open_controller;
use crate::output::Output;

/// Remove the local replica and its sidecar files
pub fn run(config: &Config, force: bool, output: &Output) -> Result<()> {
    let mut controller = open_controller(config)?;
    if controller.local_store().is_none() {
        output.message("No local store to delete.");
        return Ok(());
    }
    if controller.mode().references_local_store() {
        bail!("The local store is in use. Run `offsync online` first.");
    }

    let pending = controller.pending_edit_count();
    if pending > 0 && !force && output.should_prompt() {
        print!(
            "The local store has {} unsynced edit(s) that will be lost. Delete it? [y/N]: ",
            pending
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    controller.delete_local_store()?;
    output.success("Deleted local store");
    Ok(())
}
