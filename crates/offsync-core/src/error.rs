//! Top-level error taxonomy
//!
//! - Transport/job failures travel inside a job outcome (`JobError`)
//! - Per-row rejections are data (`SyncResult`), never errors
//! - Precondition violations are returned synchronously at the call site

use thiserror::Error;

use crate::job::JobKind;
use crate::mode::SyncMode;
use crate::remote::RemoteError;
use crate::storage::StoreError;

/// A call that is not allowed in the current state
///
/// Never queued and never silently ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    /// A job of the same kind is already running
    #[error("A {0} job is already in progress")]
    JobInFlight(JobKind),

    /// A mode transition has not finished yet
    #[error("Cannot start another transition while {0}")]
    TransitionInFlight(SyncMode),

    /// The operation is not valid in the current mode
    #[error("Cannot {operation} while in {mode} mode")]
    WrongMode {
        operation: &'static str,
        mode: SyncMode,
    },

    /// The local store backs the current view or a transition
    #[error("The local store is open and cannot be deleted")]
    StoreOpen,

    /// Jobs are running that may touch the local store
    #[error("The local store is busy with a running job")]
    StoreBusy,

    /// No local store is installed
    #[error("No local store is installed")]
    NoLocalStore,

    /// Replacing the store would throw away unsynced edits
    #[error("The local store has {0} unsynced edit(s); sync or delete it first")]
    UnsyncedEdits(usize),

    /// A go-online choice is waiting to be resolved
    #[error("A choice about pending local edits must be resolved first")]
    ChoicePending,

    /// `resolve_go_online` was called without a pending choice
    #[error("There is no pending choice to resolve")]
    NoPendingChoice,

    /// Edits are refused while the dataset is mid-transition or syncing
    #[error("Local data cannot be edited while {0}")]
    NotEditable(String),
}

/// Errors returned by the sync components
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Precondition(#[from] PreconditionViolation),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SyncError {
    /// The precondition that was violated, if any
    pub fn precondition(&self) -> Option<&PreconditionViolation> {
        match self {
            SyncError::Precondition(violation) => Some(violation),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Precondition(_) => true,
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Store(e) => e.is_recoverable(),
            SyncError::InvalidArgument(_) => false,
        }
    }
}
