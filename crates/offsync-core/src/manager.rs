//! Lifecycle of the on-device replica
//!
//! The manager exclusively owns the replica files. It creates a replica
//! through a download job, installs it once the job succeeds, and deletes
//! it only when nothing is using it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PreconditionViolation, SyncError};
use crate::job::{
    DownloadOutput, JobContext, JobError, JobHandle, JobKind, JobOutcome, JobOutput, JobRunner,
};
use crate::ledger::EditLedger;
use crate::models::{Extent, LayerId};
use crate::remote::{ExtractRequest, FeatureService};
use crate::storage::{LocalStore, StagingFile, StoreError, StoreFiles, StoreInfo, StoreMetadata};

/// How a replica should be generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Layers to take offline (empty means every layer)
    pub layers: Vec<LayerId>,
    /// Include attachments for layers that support them
    pub return_attachments: bool,
    /// Reuse a valid replica already on disk instead of downloading
    pub use_existing: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            return_attachments: true,
            use_existing: true,
        }
    }
}

impl From<&Config> for DownloadOptions {
    fn from(config: &Config) -> Self {
        Self {
            layers: config.layers.clone(),
            return_attachments: true,
            use_existing: config.use_existing,
        }
    }
}

/// What became of a finished download job
#[derive(Debug)]
pub enum DownloadResolution {
    /// A replica is installed and open
    Installed {
        info: StoreInfo,
        /// An existing replica was reused
        reused: bool,
        /// Unsynced edits the replica already carried
        pending_edits: usize,
    },
    Failed(JobError),
    Cancelled,
}

/// Owner of the replica files and the open replica handle
pub struct LocalStoreManager {
    files: StoreFiles,
    remote: Arc<dyn FeatureService>,
    current: Option<LocalStore>,
}

impl LocalStoreManager {
    pub fn new(store_path: impl Into<PathBuf>, remote: Arc<dyn FeatureService>) -> Self {
        Self {
            files: StoreFiles::new(store_path),
            remote,
            current: None,
        }
    }

    pub fn files(&self) -> &StoreFiles {
        &self.files
    }

    /// The installed replica, if any
    pub fn current(&self) -> Option<&LocalStore> {
        self.current.as_ref()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut LocalStore> {
        self.current.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.current.as_ref().is_some_and(LocalStore::is_open)
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        if let Some(store) = self.current.as_mut() {
            store.set_open(open);
        }
    }

    /// Whether the installed replica carries unsynced edits
    pub fn has_local_edits(&self) -> Result<bool, StoreError> {
        match &self.current {
            Some(store) => Ok(store.pending_edit_count()? > 0),
            None => Ok(false),
        }
    }

    /// Remove leftovers of interrupted downloads and orphaned sidecars
    pub(crate) fn clean_stale(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.files.clean_stale()
    }

    /// Pick up a replica already on disk (after a relaunch)
    ///
    /// The replica is opened but not marked open.
    pub fn detect(&mut self) -> Result<Option<&StoreInfo>, StoreError> {
        if self.current.is_none() && self.files.exists() {
            let store = LocalStore::open(self.files.primary())?;
            info!(path = ?store.path(), "Found existing local store");
            self.current = Some(store);
        }
        Ok(self.current.as_ref().map(LocalStore::info))
    }

    /// Start a download job for `aoi`
    ///
    /// With `use_existing` a valid replica already on disk is reused when it
    /// was generated for the same extent and layers. A fresh download
    /// refuses to replace a replica that has unsynced edits, whether or not
    /// it was picked up with `detect` beforehand.
    pub fn download(
        &mut self,
        runner: &mut JobRunner,
        aoi: Extent,
        options: DownloadOptions,
    ) -> Result<JobHandle, SyncError> {
        if runner.in_flight(JobKind::Download).is_some() {
            return Err(PreconditionViolation::JobInFlight(JobKind::Download).into());
        }
        if self.is_open() {
            return Err(PreconditionViolation::StoreOpen.into());
        }
        // A replica nobody has opened yet may still carry edits
        if let Err(e) = self.detect() {
            warn!(error = %e, "Existing local store is unreadable and will be replaced");
        }

        if options.use_existing {
            if let Some(store) = self
                .current
                .as_ref()
                .filter(|store| matches_request(store, &aoi, &options.layers))
            {
                let output = DownloadOutput {
                    path: store.path().to_path_buf(),
                    extent: store.info().source_extent,
                    reused: true,
                };
                let handle = runner.start(JobKind::Download, move |ctx: JobContext| async move {
                    ctx.report(0.5, "Using existing local data");
                    Ok(JobOutput::Download(output))
                })?;
                return Ok(handle);
            }
        }

        if let Some(store) = &self.current {
            let pending = store.pending_edit_count()?;
            if pending > 0 {
                return Err(PreconditionViolation::UnsyncedEdits(pending).into());
            }
        }
        // The file is about to be replaced
        if let Some(store) = self.current.take() {
            store.close()?;
        }

        let request = ExtractRequest {
            extent: aoi,
            layers: options.layers,
            return_attachments: options.return_attachments,
        };
        let remote = self.remote.clone();
        let files = self.files.clone();
        let handle = runner.start(JobKind::Download, move |ctx| {
            download_replica(ctx, remote, files, request)
        })?;
        Ok(handle)
    }

    /// Install the result of a download job and seed the ledger from it
    pub fn finish_download(
        &mut self,
        outcome: JobOutcome,
        ledger: &mut EditLedger,
    ) -> DownloadResolution {
        match outcome {
            JobOutcome::Succeeded(JobOutput::Download(output)) => {
                match self.install(&output, ledger) {
                    Ok((info, pending_edits)) => DownloadResolution::Installed {
                        info,
                        reused: output.reused,
                        pending_edits,
                    },
                    Err(e) => {
                        warn!(error = %e, "Downloaded local store could not be installed");
                        DownloadResolution::Failed(JobError::Store(e))
                    }
                }
            }
            JobOutcome::Succeeded(JobOutput::Upload(_)) => DownloadResolution::Failed(
                JobError::Aborted("download job produced an upload result".to_string()),
            ),
            JobOutcome::Failed(e) => {
                self.reattach_existing();
                DownloadResolution::Failed(e)
            }
            JobOutcome::Cancelled => {
                self.reattach_existing();
                DownloadResolution::Cancelled
            }
        }
    }

    /// Delete the replica and its sidecars
    ///
    /// Refused while the replica is open or any job is in flight. Deleting
    /// when no replica exists succeeds.
    pub fn delete(&mut self, runner: &JobRunner, ledger: &mut EditLedger) -> Result<(), SyncError> {
        if self.is_open() {
            return Err(PreconditionViolation::StoreOpen.into());
        }
        if runner.any_in_flight() {
            return Err(PreconditionViolation::StoreBusy.into());
        }

        if let Some(store) = self.current.take() {
            if let Err(e) = store.close() {
                warn!(error = %e, "Failed to close local store cleanly before deleting");
            }
        }
        self.files.remove_all()?;
        // Rebuild from the now empty replica
        ledger.seed(std::iter::empty());

        info!(path = ?self.files.primary(), "Deleted local store");
        Ok(())
    }

    fn install(
        &mut self,
        output: &DownloadOutput,
        ledger: &mut EditLedger,
    ) -> Result<(StoreInfo, usize), StoreError> {
        let reusable = self
            .current
            .as_ref()
            .is_some_and(|store| store.path() == output.path);
        if !reusable {
            if let Some(previous) = self.current.take() {
                previous.close()?;
            }
            self.current = Some(LocalStore::open(&output.path)?);
        }

        let store = self
            .current
            .as_mut()
            .ok_or_else(|| StoreError::NotFound {
                path: output.path.clone(),
            })?;
        let pending = store.pending_edits()?;
        let count = pending.len();
        ledger.seed(pending);
        store.set_open(true);

        info!(
            path = ?store.path(),
            reused = output.reused,
            pending_edits = count,
            "Local store installed"
        );
        Ok((store.info().clone(), count))
    }

    /// After a failed fresh download, pick the untouched old replica back up
    fn reattach_existing(&mut self) {
        if let Err(e) = self.detect() {
            warn!(error = %e, "Existing local store could not be reopened");
        }
    }
}

/// Whether `store` was generated for `aoi` and `layers`
///
/// An empty layer list asks for every layer, so it matches any replica.
fn matches_request(store: &LocalStore, aoi: &Extent, layers: &[LayerId]) -> bool {
    if store.info().source_extent != *aoi {
        return false;
    }
    if layers.is_empty() {
        return true;
    }
    let mut wanted = layers.to_vec();
    wanted.sort_unstable();
    wanted.dedup();
    let mut present: Vec<LayerId> = store.layers().iter().map(|layer| layer.id).collect();
    present.sort_unstable();
    wanted == present
}

/// Body of a fresh download job
async fn download_replica(
    ctx: JobContext,
    remote: Arc<dyn FeatureService>,
    files: StoreFiles,
    mut request: ExtractRequest,
) -> Result<JobOutput, JobError> {
    ctx.report(0.0, "Fetching service schema");
    let schema = remote.fetch_schema().await?;

    if request.layers.is_empty() {
        request.layers = schema.layers.iter().map(|layer| layer.id).collect();
    }
    request.return_attachments = request.return_attachments
        && request
            .layers
            .iter()
            .filter_map(|id| schema.layer(*id))
            .any(|layer| layer.supports_attachments);
    ctx.checkpoint()?;

    let progress = |fraction: f32, message: &str| ctx.report(0.05 + fraction * 0.75, message);
    let extract = remote.download_extract(&request, &progress).await?;
    ctx.checkpoint()?;

    ctx.report(0.85, "Writing local copy");
    let staging = StagingFile::create(&files)?;
    let staging_path = staging.path().to_path_buf();
    let meta = StoreMetadata {
        service_url: remote.url().to_string(),
        extent: request.extent,
        created_at: Utc::now(),
    };
    tokio::task::spawn_blocking(move || LocalStore::create(&staging_path, &meta, &extract))
        .await
        .map_err(|e| JobError::Aborted(e.to_string()))??;

    // Point of no return: from here on the replica replaces any previous one
    ctx.commit()?;
    files.install(staging)?;

    Ok(JobOutput::Download(DownloadOutput {
        path: files.primary().to_path_buf(),
        extent: request.extent,
        reused: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobEvent;
    use crate::models::{EditKind, RowKey};
    use crate::remote::fake::FakeFeatureService;
    use crate::remote::RemoteError;
    use serde_json::Map;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _temp_dir: TempDir,
        remote: Arc<FakeFeatureService>,
        runner: JobRunner,
        events: mpsc::UnboundedReceiver<JobEvent>,
        manager: LocalStoreManager,
        ledger: EditLedger,
    }

    impl Harness {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let remote = Arc::new(FakeFeatureService::new());
            let mut runner = JobRunner::new();
            let events = runner.take_events().unwrap();
            let manager = LocalStoreManager::new(
                temp_dir.path().join("replica.geodatabase"),
                remote.clone(),
            );
            Self {
                _temp_dir: temp_dir,
                remote,
                runner,
                events,
                manager,
                ledger: EditLedger::new(),
            }
        }

        fn aoi() -> Extent {
            Extent::new(-100.0, -50.0, 100.0, 50.0).unwrap()
        }

        fn start(&mut self, options: DownloadOptions) -> Result<JobHandle, SyncError> {
            self.manager
                .download(&mut self.runner, Self::aoi(), options)
        }

        /// Wait for the download to complete and hand it to the manager
        async fn finish(&mut self) -> DownloadResolution {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out")
                    .expect("channel closed");
                self.runner.observe(&event);
                if let JobEvent::Completed { handle, outcome } = event {
                    self.runner.complete(handle);
                    return self.manager.finish_download(outcome, &mut self.ledger);
                }
            }
        }

        async fn download(&mut self, options: DownloadOptions) -> DownloadResolution {
            self.start(options).unwrap();
            self.finish().await
        }
    }

    #[tokio::test]
    async fn test_fresh_download_installs_store() {
        let mut h = Harness::new();

        let resolution = h.download(DownloadOptions::default()).await;
        match resolution {
            DownloadResolution::Installed {
                info,
                reused,
                pending_edits,
            } => {
                assert_eq!(info.source_extent, Harness::aoi());
                assert!(!reused);
                assert_eq!(pending_edits, 0);
            }
            other => panic!("unexpected resolution {:?}", other),
        }

        assert!(h.manager.is_open());
        assert!(h.manager.files().exists());
        assert!(!h.manager.files().staging().exists());

        let request = &h.remote.extract_requests()[0];
        assert_eq!(request.layers, vec![0, 1]);
        assert!(request.return_attachments);
    }

    #[tokio::test]
    async fn test_attachments_skipped_when_no_layer_supports_them() {
        let mut h = Harness::new();
        h.download(DownloadOptions {
            layers: vec![1],
            ..DownloadOptions::default()
        })
        .await;

        let request = &h.remote.extract_requests()[0];
        assert_eq!(request.layers, vec![1]);
        assert!(!request.return_attachments);
        assert_eq!(h.manager.current().unwrap().layers().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_installs_nothing() {
        let mut h = Harness::new();
        h.remote
            .fail_download(RemoteError::Unreachable("network down".to_string()));

        let resolution = h.download(DownloadOptions::default()).await;
        match resolution {
            DownloadResolution::Failed(e) => assert!(e.is_retryable()),
            other => panic!("unexpected resolution {:?}", other),
        }
        assert!(h.manager.current().is_none());
        assert!(!h.manager.files().exists());
        assert!(!h.manager.files().staging().exists());
    }

    #[tokio::test]
    async fn test_cancelled_download_leaves_no_files() {
        let mut h = Harness::new();
        let _gate = h.remote.gate_downloads();

        let handle = h.start(DownloadOptions::default()).unwrap();
        assert!(h.runner.cancel(handle));

        assert!(matches!(h.finish().await, DownloadResolution::Cancelled));
        assert!(h.manager.current().is_none());
        assert!(!h.manager.files().exists());
        assert!(!h.manager.files().staging().exists());
    }

    #[tokio::test]
    async fn test_reuses_existing_store_with_its_edits() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;

        // Edit offline, then leave local mode
        let store = h.manager.current_mut().unwrap();
        store.add_feature(0, &Map::new(), None).unwrap();
        h.manager.set_open(false);

        let resolution = h.download(DownloadOptions::default()).await;
        match resolution {
            DownloadResolution::Installed {
                reused,
                pending_edits,
                ..
            } => {
                assert!(reused);
                assert_eq!(pending_edits, 1);
            }
            other => panic!("unexpected resolution {:?}", other),
        }
        assert_eq!(
            h.ledger.pending_kind(RowKey::feature(0, -1)),
            Some(EditKind::Add)
        );
        assert_eq!(h.remote.extract_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_download_refused_with_unsynced_edits() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager
            .current_mut()
            .unwrap()
            .update_feature(0, 1, &Map::new(), None)
            .unwrap();
        h.manager.set_open(false);

        let err = h
            .start(DownloadOptions {
                use_existing: false,
                ..DownloadOptions::default()
            })
            .unwrap_err();
        assert_eq!(
            err.precondition(),
            Some(&PreconditionViolation::UnsyncedEdits(1))
        );
    }

    #[tokio::test]
    async fn test_reuse_requires_same_extent() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager.set_open(false);

        let elsewhere = Extent::new(0.0, 0.0, 10.0, 10.0).unwrap();
        h.manager
            .download(&mut h.runner, elsewhere, DownloadOptions::default())
            .unwrap();
        match h.finish().await {
            DownloadResolution::Installed { info, reused, .. } => {
                assert!(!reused);
                assert_eq!(info.source_extent, elsewhere);
            }
            other => panic!("unexpected resolution {:?}", other),
        }
        assert_eq!(h.remote.extract_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_reuse_requires_same_layers() {
        let mut h = Harness::new();
        h.download(DownloadOptions {
            layers: vec![1],
            ..DownloadOptions::default()
        })
        .await;
        h.manager.set_open(false);

        let resolution = h
            .download(DownloadOptions {
                layers: vec![0],
                ..DownloadOptions::default()
            })
            .await;
        assert!(matches!(
            resolution,
            DownloadResolution::Installed { reused: false, .. }
        ));
        let layers: Vec<LayerId> = h
            .manager
            .current()
            .unwrap()
            .layers()
            .iter()
            .map(|layer| layer.id)
            .collect();
        assert_eq!(layers, vec![0]);
    }

    #[tokio::test]
    async fn test_other_extent_refused_with_unsynced_edits() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager
            .current_mut()
            .unwrap()
            .add_feature(0, &Map::new(), None)
            .unwrap();
        h.manager.set_open(false);

        let elsewhere = Extent::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let err = h
            .manager
            .download(&mut h.runner, elsewhere, DownloadOptions::default())
            .unwrap_err();
        assert_eq!(
            err.precondition(),
            Some(&PreconditionViolation::UnsyncedEdits(1))
        );
        assert_eq!(h.manager.current().unwrap().info().source_extent, Harness::aoi());
    }

    #[tokio::test]
    async fn test_fresh_download_checks_store_not_yet_detected() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager
            .current_mut()
            .unwrap()
            .add_feature(0, &Map::new(), None)
            .unwrap();
        h.manager.set_open(false);
        let path = h.manager.files().primary().to_path_buf();
        drop(h.manager.current.take());

        let mut relaunched = LocalStoreManager::new(path, h.remote.clone());
        let err = relaunched
            .download(
                &mut h.runner,
                Harness::aoi(),
                DownloadOptions {
                    use_existing: false,
                    ..DownloadOptions::default()
                },
            )
            .unwrap_err();

        assert_eq!(
            err.precondition(),
            Some(&PreconditionViolation::UnsyncedEdits(1))
        );
        assert!(relaunched.files().exists());
        assert_eq!(relaunched.current().unwrap().pending_edit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fresh_download_replaces_clean_store() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager.set_open(false);

        let resolution = h
            .download(DownloadOptions {
                use_existing: false,
                ..DownloadOptions::default()
            })
            .await;
        assert!(matches!(
            resolution,
            DownloadResolution::Installed { reused: false, .. }
        ));
        assert_eq!(h.remote.extract_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fresh_download_keeps_previous_store() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager.set_open(false);
        h.remote.fail_download(RemoteError::StorageFull);

        let resolution = h
            .download(DownloadOptions {
                use_existing: false,
                ..DownloadOptions::default()
            })
            .await;
        assert!(matches!(resolution, DownloadResolution::Failed(_)));
        assert!(h.manager.current().is_some());
        assert!(!h.manager.is_open());
    }

    #[tokio::test]
    async fn test_delete_refused_while_open() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;

        let err = h.manager.delete(&h.runner, &mut h.ledger).unwrap_err();
        assert_eq!(err.precondition(), Some(&PreconditionViolation::StoreOpen));
        assert!(h.manager.files().exists());
    }

    #[tokio::test]
    async fn test_delete_refused_while_job_in_flight() {
        let mut h = Harness::new();
        let _gate = h.remote.gate_downloads();
        h.start(DownloadOptions::default()).unwrap();

        let err = h.manager.delete(&h.runner, &mut h.ledger).unwrap_err();
        assert_eq!(err.precondition(), Some(&PreconditionViolation::StoreBusy));
    }

    #[tokio::test]
    async fn test_delete_removes_store_and_sidecars() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        h.manager
            .current_mut()
            .unwrap()
            .add_feature(0, &Map::new(), None)
            .unwrap();
        h.ledger.record_add(RowKey::feature(0, -1));
        h.manager.set_open(false);

        h.manager.delete(&h.runner, &mut h.ledger).unwrap();

        assert!(h.manager.current().is_none());
        assert!(!h.manager.files().exists());
        assert!(h.manager.files().sidecars().iter().all(|p| !p.exists()));
        assert_eq!(h.ledger.pending_count(), 0);
        assert!(!h.ledger.has_local_edits());

        // Nothing left to delete is still success
        h.manager.delete(&h.runner, &mut h.ledger).unwrap();
    }

    #[tokio::test]
    async fn test_detect_existing_store() {
        let mut h = Harness::new();
        h.download(DownloadOptions::default()).await;
        let path = h.manager.files().primary().to_path_buf();

        let mut relaunched = LocalStoreManager::new(path, h.remote.clone());
        let info = relaunched.detect().unwrap().cloned().unwrap();
        assert_eq!(info.source_extent, Harness::aoi());
        assert!(!relaunched.is_open());
    }
}
