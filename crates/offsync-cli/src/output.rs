//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag), one object per line for events
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use offsync_core::{OutcomeSummary, SyncEvent, SyncResult};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print an event published by the controller
    pub fn print_event(&self, event: &SyncEvent) {
        match self.format {
            OutputFormat::Human => match event {
                SyncEvent::ModeChanged { mode } => println!("Mode: {}", mode),
                SyncEvent::JobProgress {
                    kind,
                    fraction,
                    message,
                    ..
                } => println!("[{}] {:>3.0}% {}", kind, fraction * 100.0, message),
                SyncEvent::JobCompleted { kind, outcome, .. } => match outcome {
                    OutcomeSummary::Succeeded {
                        feature_errors,
                        attachment_errors,
                    } => {
                        let rejected = feature_errors + attachment_errors;
                        if rejected == 0 {
                            println!("✓ {} completed", kind);
                        } else {
                            println!("✓ {} completed ({} edit(s) rejected)", kind, rejected);
                        }
                    }
                    OutcomeSummary::Failed { message, retryable } => {
                        let hint = if *retryable { " (try again later)" } else { "" };
                        println!("✗ {} failed: {}{}", kind, message, hint);
                    }
                    OutcomeSummary::Cancelled => println!("{} cancelled", kind),
                },
                SyncEvent::PendingEditCountChanged { .. } => {}
                SyncEvent::ChoiceRequired { pending_edits } => {
                    println!("{} unsynced edit(s) in the local store", pending_edits)
                }
                SyncEvent::LocalDataFound { pending_edits } => println!(
                    "Using existing local data ({} unsynced edit(s))",
                    pending_edits
                ),
            },
            OutputFormat::Json => print_json_line(event),
            OutputFormat::Quiet => {}
        }
    }

    /// Print the outcome of an upload, rejected rows included
    pub fn print_sync_result(&self, result: &SyncResult) {
        match self.format {
            OutputFormat::Human => {
                println!("Applied {} edit(s)", result.applied.len());
                let failures = result
                    .per_feature_errors
                    .iter()
                    .chain(result.per_attachment_errors.iter());
                let mut any = false;
                for failure in failures {
                    if !any {
                        println!();
                        println!("Rejected edits:");
                        any = true;
                    }
                    println!("  {}: {}", failure.identifier, failure.message);
                }
                if !result.deferred_attachments.is_empty() {
                    println!();
                    println!("Attachments waiting for a rejected feature:");
                    for key in &result.deferred_attachments {
                        println!("  {}", key);
                    }
                }
            }
            OutputFormat::Json => print_json(result),
            OutputFormat::Quiet => {
                for key in result.failed_identifiers() {
                    println!("{}", key);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Pretty-print a value as JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

fn print_json_line<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}
