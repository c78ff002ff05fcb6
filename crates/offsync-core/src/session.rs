//! Persisted session state
//!
//! Only the last stable mode is remembered; a transient mode is never
//! written, so a relaunch never resumes mid-transition.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mode::SyncMode;
use crate::storage::{atomic_write, StoreError, StoreResult};

/// Contents of `session.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub mode: SyncMode,
    pub updated_at: DateTime<Utc>,
}

/// The session file on disk
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the session; a missing file means a first launch
    pub fn load(&self) -> StoreResult<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| StoreError::from_io(e, self.path.clone()))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Remember `mode` if it is stable
    pub fn save(&self, mode: SyncMode) -> StoreResult<()> {
        if mode.is_transient() {
            return Ok(());
        }
        let session = Session {
            mode,
            updated_at: Utc::now(),
        };
        atomic_write(&self.path, serde_json::to_string_pretty(&session)?.as_bytes())?;
        debug!(mode = %mode, "Session saved");
        Ok(())
    }
}
