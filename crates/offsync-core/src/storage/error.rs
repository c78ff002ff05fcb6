//! Local store error handling
//!
//! Typed errors for replica files and SQLite access, each classified as
//! recoverable or not, with a hint for the user where one exists.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{LayerId, RowKey};

/// Errors that can occur while creating, opening or editing the replica
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cannot create directory '{path}' for the local store: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No permission to access '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Out of space; surfaces as storage-full on download jobs
    #[error("No space left while writing '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A store file or sidecar could not be deleted
    #[error("Cannot remove '{path}': {source}")]
    RemoveError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' does not exist")]
    NotFound { path: PathBuf },

    /// Renaming a staged file into place failed
    #[error("Cannot move '{from}' into place at '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file was never completely written
    #[error("Local store at '{path}' is incomplete and cannot be opened")]
    Incomplete { path: PathBuf },

    /// The file was written by an incompatible version
    #[error("Local store at '{path}' has schema version {found}, expected {expected}")]
    SchemaMismatch {
        path: PathBuf,
        found: i32,
        expected: i32,
    },

    /// Journal files were left behind without their store
    #[error("Found sidecar '{path}' without its local store")]
    OrphanedSidecar { path: PathBuf },

    /// The layer was not part of the downloaded replica
    #[error("Layer {0} is not part of the local store")]
    UnknownLayer(LayerId),

    /// Attachments were requested for a layer that does not support them
    #[error("Layer {0} does not support attachments")]
    AttachmentsUnsupported(LayerId),

    /// The row does not exist in the local store
    #[error("{0} does not exist in the local store")]
    UnknownRow(RowKey),

    /// Stored JSON could not be read back
    #[error("Invalid stored data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Local store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Local store I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Attach `path` to an I/O error, sorting out permission, missing
    /// file and out-of-space failures
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StoreError::NotFound { path },
            _ if is_disk_full_error(&error) => StoreError::DiskFull {
                path,
                source: error,
            },
            _ => StoreError::WriteError {
                path,
                source: error,
            },
        }
    }

    /// Whether the user can fix the cause and retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            StoreError::DiskFull { .. }
            | StoreError::PermissionDenied { .. }
            | StoreError::Incomplete { .. }
            | StoreError::OrphanedSidecar { .. } => true,
            StoreError::Database(e) => is_disk_full_sqlite(e),
            _ => false,
        }
    }

    /// What the user can do about it, if anything
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::DiskFull { .. } => Some("Free some space on the device, then retry."),
            StoreError::Database(e) if is_disk_full_sqlite(e) => {
                Some("Free some space on the device, then retry.")
            }
            StoreError::PermissionDenied { .. } | StoreError::CreateDirectory { .. } => {
                Some("Make sure the data directory is writable, or point data_dir elsewhere.")
            }
            StoreError::Incomplete { .. } => {
                Some("The previous download did not finish. Go offline again to download a fresh copy.")
            }
            StoreError::SchemaMismatch { .. } => {
                Some("Delete the local store and go offline again to download a compatible copy.")
            }
            StoreError::OrphanedSidecar { .. } => {
                Some("Restart to let stale journal files be cleaned up.")
            }
            _ => None,
        }
    }
}

/// Out-of-space detection by message; `io::ErrorKind::StorageFull` is
/// not stable on all supported toolchains
pub(crate) fn is_disk_full_error(error: &io::Error) -> bool {
    const MARKERS: [&str; 4] = ["no space left", "disk full", "quota exceeded", "not enough space"];
    let msg = error.to_string().to_lowercase();
    MARKERS.iter().any(|marker| msg.contains(marker))
}

fn is_disk_full_sqlite(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DiskFull)
    )
}

/// Result type for local store operations
pub type StoreResult<T> = Result<T, StoreError>;
