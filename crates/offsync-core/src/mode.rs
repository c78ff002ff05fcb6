//! Sync mode: which dataset is authoritative right now

use std::fmt;

use serde::{Deserialize, Serialize};

/// The single source of truth for what data may be read or written
///
/// Only `SyncModeController` changes it, always through a named transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Reading and writing the remote feature service
    #[default]
    Live,
    /// Downloading a local replica
    GoingLocal,
    /// Reading and writing the local replica
    Local,
    /// Switching back to the remote feature service
    GoingLive,
}

impl SyncMode {
    /// Whether the mode is a transition that must end in a stable mode
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncMode::GoingLocal | SyncMode::GoingLive)
    }

    /// Whether the local replica backs the current view or transition
    pub fn references_local_store(&self) -> bool {
        matches!(
            self,
            SyncMode::GoingLocal | SyncMode::Local | SyncMode::GoingLive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Live => "live",
            SyncMode::GoingLocal => "going local",
            SyncMode::Local => "local",
            SyncMode::GoingLive => "going live",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
