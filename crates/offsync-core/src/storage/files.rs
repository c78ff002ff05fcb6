//! On-disk layout of the local replica
//!
//! Files:
//! - `{store}` - the SQLite replica
//! - `{store}-wal`, `{store}-shm`, `{store}-journal` - SQLite sidecars
//! - `{store}.partial` - staging file written by a download job
//!
//! Sidecars always go together with their primary file. Deleting the
//! primary while leaving a journal behind would let SQLite replay a stale
//! journal into the next replica at that path.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};

const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];
const STAGING_SUFFIX: &str = ".partial";

/// Paths belonging to one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFiles {
    primary: PathBuf,
}

impl StoreFiles {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn sidecars(&self) -> Vec<PathBuf> {
        sidecars_of(&self.primary)
    }

    pub fn staging(&self) -> PathBuf {
        with_suffix(&self.primary, STAGING_SUFFIX)
    }

    pub fn exists(&self) -> bool {
        self.primary.exists()
    }

    /// Sidecars present on disk without their primary file
    pub fn orphaned_sidecars(&self) -> Vec<PathBuf> {
        if self.primary.exists() {
            return Vec::new();
        }
        self.sidecars().into_iter().filter(|p| p.exists()).collect()
    }

    /// Create the directory holding the replica
    pub fn ensure_dir(&self) -> StoreResult<()> {
        if let Some(parent) = self.primary.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Remove the replica and every sidecar
    ///
    /// Sidecars go first so a failure never leaves journals without a store.
    pub fn remove_all(&self) -> StoreResult<()> {
        for path in self.sidecars() {
            remove_if_exists(&path)?;
        }
        remove_if_exists(&self.primary)
    }

    /// Remove leftovers of interrupted downloads and orphaned sidecars
    ///
    /// Returns the paths that were removed.
    pub fn clean_stale(&self) -> StoreResult<Vec<PathBuf>> {
        let staging = self.staging();
        let mut stale: Vec<PathBuf> = sidecars_of(&staging);
        stale.push(staging);
        stale.extend(self.orphaned_sidecars());

        let mut removed = Vec::new();
        for path in stale {
            if path.exists() {
                remove_if_exists(&path)?;
                warn!(path = ?path, "Removed stale local store file");
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Move a completely written staging file into place
    ///
    /// Any previous replica at the primary path is replaced by the rename
    /// itself, so a failed install leaves it in place. Its sidecars are
    /// removed first.
    pub fn install(&self, staging: StagingFile) -> StoreResult<()> {
        for path in self.sidecars() {
            remove_if_exists(&path)?;
        }
        fs::rename(staging.path(), &self.primary).map_err(|source| {
            StoreError::AtomicWriteFailed {
                from: staging.path().to_path_buf(),
                to: self.primary.clone(),
                source,
            }
        })?;
        staging.persist();
        debug!(path = ?self.primary, "Installed local store");
        Ok(())
    }
}

/// A staging file that is removed on drop unless persisted
///
/// Covers failure, cancellation and task abort of a download job alike.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    armed: bool,
}

impl StagingFile {
    /// Claim the staging path of `files`, clearing leftovers of earlier attempts
    pub fn create(files: &StoreFiles) -> StoreResult<Self> {
        files.ensure_dir()?;
        let staging = Self {
            path: files.staging(),
            armed: true,
        };
        staging.remove_files()?;
        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; it has been moved into place
    pub fn persist(mut self) {
        self.armed = false;
    }

    fn remove_files(&self) -> StoreResult<()> {
        for path in sidecars_of(&self.path) {
            remove_if_exists(&path)?;
        }
        remove_if_exists(&self.path)
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.remove_files() {
                warn!(path = ?self.path, error = %e, "Failed to remove staging file");
            }
        }
    }
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// This ensures the target file is never left in a partially-written state.
pub fn atomic_write(path: &Path, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StoreError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

fn sidecars_of(path: &Path) -> Vec<PathBuf> {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| with_suffix(path, suffix))
        .collect()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::RemoveError {
            path: path.to_path_buf(),
            source,
        }),
    }
}
