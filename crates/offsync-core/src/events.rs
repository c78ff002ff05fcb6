//! Presentation-facing event channel
//!
//! The core publishes every externally observable change here. UI code
//! subscribes and renders; it never holds references into the core.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{JobId, JobKind};
use crate::mode::SyncMode;

/// Events emitted by the sync core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The authoritative dataset changed
    ModeChanged { mode: SyncMode },
    /// A job reported progress
    JobProgress {
        job: JobId,
        kind: JobKind,
        fraction: f32,
        message: String,
    },
    /// A job reached its terminal state
    JobCompleted {
        job: JobId,
        kind: JobKind,
        outcome: OutcomeSummary,
    },
    /// Number of unsynced local edits changed (badge)
    PendingEditCountChanged { count: usize },
    /// Going online needs a decision about pending edits
    ChoiceRequired { pending_edits: usize },
    /// An existing replica was reused instead of downloaded
    LocalDataFound { pending_edits: usize },
}

/// Terminal state of a job as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeSummary {
    Succeeded {
        feature_errors: usize,
        attachment_errors: usize,
    },
    Failed {
        message: String,
        retryable: bool,
    },
    Cancelled,
}

impl OutcomeSummary {
    pub fn succeeded() -> Self {
        OutcomeSummary::Succeeded {
            feature_errors: 0,
            attachment_errors: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeSummary::Succeeded { .. })
    }
}

/// Capacity of the broadcast buffer; slow observers see `Lagged`
const EVENT_CAPACITY: usize = 256;

/// Cloneable publisher for `SyncEvent`s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
