//! offsync Core Library
//!
//! This crate provides the core of offsync, an offline/online sync
//! controller for remote feature data: take an area offline as a local
//! replica, edit it, upload the edits and switch back to live data.
//!
//! # Architecture
//!
//! - **SyncModeController**: owns the current `SyncMode` and is the single
//!   coordination point; job results come back to it as events
//! - **JobRunner**: runs downloads and uploads on spawned tasks, at most one
//!   per kind
//! - **LocalStoreManager**: sole owner of the replica files
//! - **SyncOrchestrator**: two-phase upload (features, then attachments)
//! - **EditLedger**: per-row count of unsynced edits
//!
//! # Quick Start
//!
//! ```text
//! let remote = Arc::new(HttpFeatureService::new(url, timeout)?);
//! let mut controller = SyncModeController::new(&config, remote);
//! controller.restore()?;
//!
//! controller.go_offline(extent, DownloadOptions::from(&config))?;
//! controller.run_until_idle().await;
//!
//! controller.apply_edit(&edit)?;
//! controller.sync_now()?;
//! controller.run_until_idle().await;
//! ```
//!
//! # Modules
//!
//! - `controller`: the mode state machine (main entry point)
//! - `job`: job handles, outcomes and the runner
//! - `manager`: replica lifecycle
//! - `orchestrator`: upload of local edits
//! - `ledger`: pending edit counts
//! - `storage`: SQLite replica and its files
//! - `remote`: the feature service seam and its HTTP client
//! - `events`: presentation-facing event channel
//! - `session`: last stable mode across relaunches
//! - `config`: application configuration

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod job;
pub mod ledger;
pub mod manager;
pub mod mode;
pub mod models;
pub mod orchestrator;
pub mod remote;
pub mod session;
pub mod storage;

pub use config::Config;
pub use controller::{ChoiceOutcome, GoOnline, OnlineChoice, SyncModeController};
pub use error::{PreconditionViolation, SyncError};
pub use events::{EventBus, OutcomeSummary, SyncEvent};
pub use job::{BackgroundExecution, JobHandle, JobKind, JobRunner, JobStatus};
pub use ledger::{EditLedger, TableCounts};
pub use manager::{DownloadOptions, LocalStoreManager};
pub use mode::SyncMode;
pub use models::{EditError, EditKind, Extent, LocalEdit, RowKey, SyncResult, TableKey};
pub use orchestrator::SyncOrchestrator;
pub use remote::{FeatureService, HttpFeatureService, RemoteError};
pub use storage::{LocalStore, StoreError, StoreInfo};
