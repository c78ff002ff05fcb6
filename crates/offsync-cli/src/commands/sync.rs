//! Sync command handler

use anyhow::{bail, Result};

use offsync_core::{Config, JobKind, OutcomeSummary};

use crate::commands::{drive, open_controller};
use crate::output::Output;

/// Upload pending edits from the local replica
pub async fn run(config: &Config, output: &Output) -> Result<()> {
    let mut controller = open_controller(config)?;
    if !controller.has_local_edits() {
        output.message("No unsynced edits.");
        return Ok(());
    }

    let mut events = controller.subscribe();
    controller.sync_now()?;
    let completed = drive(&mut controller, &mut events, output).await;
    ensure_uploaded(&completed)?;

    if let Some(result) = controller.last_sync_result() {
        output.print_sync_result(result);
    }
    Ok(())
}

/// Fail unless an upload job finished successfully
pub fn ensure_uploaded(completed: &[(JobKind, OutcomeSummary)]) -> Result<()> {
    let upload = completed
        .iter()
        .rev()
        .find(|(kind, _)| *kind == JobKind::Upload)
        .map(|(_, outcome)| outcome);

    match upload {
        Some(outcome) if outcome.is_success() => Ok(()),
        Some(OutcomeSummary::Failed { message, .. }) => bail!("Sync failed: {}", message),
        Some(_) => bail!("Sync was cancelled"),
        None => bail!("Sync did not complete"),
    }
}
