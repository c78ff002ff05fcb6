//! Online command handler

use std::io::{self, Write};

use anyhow::{bail, Result};

use offsync_core::{ChoiceOutcome, Config, GoOnline, OnlineChoice, SyncMode};

use crate::commands::{drive, open_controller};
use crate::output::Output;

/// Switch back to live data, resolving pending edits first if needed
pub async fn run(config: &Config, sync: bool, discard: bool, output: &Output) -> Result<()> {
    let mut controller = open_controller(config)?;
    if controller.mode() == SyncMode::Live {
        output.message("Already working with live data.");
        return Ok(());
    }

    let mut events = controller.subscribe();
    if let GoOnline::ChoiceRequired { pending_edits } = controller.go_online()? {
        let choice = if sync {
            OnlineChoice::SyncThenSwitch
        } else if discard {
            OnlineChoice::Discard
        } else if output.should_prompt() {
            prompt_choice(pending_edits)?
        } else {
            bail!(
                "{} unsynced edit(s); pass --sync to upload them first or --discard to leave them in the local store",
                pending_edits
            );
        };

        if let ChoiceOutcome::Syncing(handle) = controller.resolve_go_online(choice)? {
            tracing::debug!(%handle, "Uploading before switching to live data");
        }
    }

    drive(&mut controller, &mut events, output).await;

    if let Some(result) = controller.last_sync_result() {
        if sync && !result.is_clean() {
            output.print_sync_result(result);
        }
    }
    if controller.mode() != SyncMode::Live {
        bail!("Still working with local data");
    }
    output.success("Working with live data");
    Ok(())
}

fn prompt_choice(pending_edits: usize) -> Result<OnlineChoice> {
    println!(
        "You have {} unsynced edit(s) in the local store.",
        pending_edits
    );
    print!("Sync them before going online? [S]ync / [d]iscard / [c]ancel: ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    match parse_choice(&input) {
        Some(choice) => Ok(choice),
        None => bail!("Cancelled."),
    }
}

/// Interpret the answer to the sync prompt; `None` means cancel
fn parse_choice(input: &str) -> Option<OnlineChoice> {
    match input.trim().to_lowercase().as_str() {
        "" | "s" | "sync" => Some(OnlineChoice::SyncThenSwitch),
        "d" | "discard" => Some(OnlineChoice::Discard),
        _ => None,
    }
}
