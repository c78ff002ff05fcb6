//! Long-running jobs
//!
//! A job is one asynchronous unit of work (download a replica, upload edits).
//! Work runs on a spawned task and talks back to the coordination loop only
//! through `JobEvent`s:
//!
//! - zero or more `Progress` events
//! - exactly one `Completed` event, always last
//!
//! The runner never retries; retry policy belongs to the caller.

pub mod background;
pub mod context;
pub mod runner;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Extent, IdRemap, SyncResult};
use crate::remote::RemoteError;
use crate::storage::StoreError;

pub use background::{BackgroundExecution, CompletionHandler, NoBackground};
pub use context::JobContext;
pub use runner::JobRunner;

/// Unique identifier of a job
pub type JobId = Uuid;

/// The kinds of job; at most one of each may be in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Upload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Download => "download",
            JobKind::Upload => "upload",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reference to a started job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

impl JobHandle {
    pub(crate) fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, &self.id.to_string()[..8])
    }
}

/// Status of a job as last observed by the coordination loop
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running { progress: f32, message: String },
    Succeeded,
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

/// Value produced by a successful download job
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutput {
    /// Where the complete replica now lives
    pub path: PathBuf,
    pub extent: Extent,
    /// An existing replica was reused instead of downloading a new one
    pub reused: bool,
}

/// Value produced by a successful upload job
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutput {
    pub result: SyncResult,
    /// Temporary ids the service replaced during the upload
    pub remaps: Vec<IdRemap>,
}

/// Typed result of a job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Download(DownloadOutput),
    Upload(UploadOutput),
}

/// Job-level failure cause
#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cancellation won the race; reported as `JobOutcome::Cancelled`
    #[error("Job was cancelled")]
    Cancelled,

    /// The job task ended without producing a result
    #[error("Job aborted: {0}")]
    Aborted(String),
}

impl JobError {
    /// Whether starting the same job again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Remote(e) => e.is_retryable(),
            JobError::Store(e) => e.is_recoverable(),
            JobError::Cancelled => true,
            JobError::Aborted(_) => true,
        }
    }
}

/// Terminal state of a job, delivered exactly once
#[derive(Debug)]
pub enum JobOutcome {
    Succeeded(JobOutput),
    Failed(JobError),
    Cancelled,
}

impl JobOutcome {
    pub(crate) fn from_result(result: Result<JobOutput, JobError>) -> Self {
        match result {
            Ok(output) => JobOutcome::Succeeded(output),
            Err(JobError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(e),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded(_) => JobStatus::Succeeded,
            JobOutcome::Failed(e) => JobStatus::Failed(e.to_string()),
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Messages from job tasks to the coordination loop
#[derive(Debug)]
pub enum JobEvent {
    Progress {
        handle: JobHandle,
        fraction: f32,
        message: String,
    },
    Completed {
        handle: JobHandle,
        outcome: JobOutcome,
    },
    /// The platform resumed the process while the job was running
    Resumed { handle: JobHandle },
}

impl JobEvent {
    pub fn handle(&self) -> JobHandle {
        match self {
            JobEvent::Progress { handle, .. }
            | JobEvent::Completed { handle, .. }
            | JobEvent::Resumed { handle } => *handle,
        }
    }
}
