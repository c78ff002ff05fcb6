//! Local replica storage
//!
//! ## Architecture
//!
//! - **Replica**: SQLite file holding the offline copy and its durable
//!   change tracking
//! - **Files**: primary file, SQLite sidecars and the download staging file,
//!   always managed together
//!
//! Download jobs write a staging file and rename it into place only once it
//! is complete, so the primary path never holds a partial replica.

pub mod error;
pub mod files;
pub mod replica;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use files::{atomic_write, StagingFile, StoreFiles};
pub use replica::{AppliedEdit, LocalStore, StoreInfo, StoreMetadata};
pub use schema::SCHEMA_VERSION;
