//! Command handlers

pub mod config;
pub mod delete;
pub mod edit;
pub mod offline;
pub mod online;
pub mod status;
pub mod sync;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::{self, error::TryRecvError};

use offsync_core::{
    Config, HttpFeatureService, JobKind, OutcomeSummary, SyncEvent, SyncModeController,
};

use crate::output::Output;

/// Build the controller for `config` and restore the last session
pub fn open_controller(config: &Config) -> Result<SyncModeController> {
    let Some(url) = config.service_url.as_deref() else {
        bail!(
            "Feature service URL not configured. Set it with:\n  \
             offsync config set service_url https://host/FeatureServer"
        );
    };

    let remote = HttpFeatureService::new(url, config.request_timeout())
        .context("Failed to create feature service client")?;
    let mut controller = SyncModeController::new(config, Arc::new(remote));
    controller
        .restore()
        .context("Failed to restore previous session")?;
    Ok(controller)
}

/// Process controller events until it is idle, printing them as they come
///
/// Returns the terminal outcome of every job that finished meanwhile.
/// Ctrl-C requests cancellation of running jobs; the loop still waits for
/// their completion.
pub async fn drive(
    controller: &mut SyncModeController,
    events: &mut broadcast::Receiver<SyncEvent>,
    output: &Output,
) -> Vec<(JobKind, OutcomeSummary)> {
    let mut completed = Vec::new();
    let mut interrupted = false;
    loop {
        print_pending(events, output, &mut completed);
        if controller.is_idle() {
            return completed;
        }

        tokio::select! {
            _ = controller.next_event() => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                output.message("Cancelling...");
                controller.cancel_download();
                controller.cancel_sync();
            }
        }
    }
}

fn print_pending(
    events: &mut broadcast::Receiver<SyncEvent>,
    output: &Output,
    completed: &mut Vec<(JobKind, OutcomeSummary)>,
) {
    loop {
        match events.try_recv() {
            Ok(event) => {
                output.print_event(&event);
                if let SyncEvent::JobCompleted { kind, outcome, .. } = event {
                    completed.push((kind, outcome));
                }
            }
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Output fell behind controller events");
            }
            Err(_) => return,
        }
    }
}
