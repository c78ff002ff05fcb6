//! The sync mode state machine
//!
//! `SyncModeController` is the only place the mode changes and the single
//! coordination point of the core. It owns the job runner, the store
//! manager, the orchestrator and the ledger, and runs on one task: job work
//! happens elsewhere and comes back as events that `next_event` processes
//! one at a time.
//!
//! ```text
//!            go_offline               download ok
//!   Live ───────────────▶ GoingLocal ─────────────▶ Local
//!    ▲                        │ failed/cancelled     │  go_online
//!    │                        ▼                      ▼  (choice resolved)
//!    └──────────────────── Live          Local ◀── GoingLive ──▶ Live
//!                                       attach failed     attached
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PreconditionViolation, SyncError};
use crate::events::{EventBus, OutcomeSummary, SyncEvent};
use crate::job::{
    BackgroundExecution, JobEvent, JobHandle, JobKind, JobOutcome, JobRunner, JobStatus,
    NoBackground,
};
use crate::ledger::EditLedger;
use crate::manager::{DownloadOptions, DownloadResolution, LocalStoreManager};
use crate::mode::SyncMode;
use crate::models::{Extent, LocalEdit, RowKey, SyncResult};
use crate::orchestrator::{SyncOrchestrator, SyncResolution};
use crate::remote::{FeatureService, RemoteError, ServiceSchema};
use crate::session::SessionFile;
use crate::storage::LocalStore;

/// Answer to `go_online`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoOnline {
    /// No pending edits; the switch to live data has started
    Switching,
    /// Pending edits exist; call `resolve_go_online` to continue
    ChoiceRequired { pending_edits: usize },
}

/// How to continue going online with pending edits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineChoice {
    /// Upload first, then switch once the upload succeeded
    SyncThenSwitch,
    /// Switch without uploading; the replica keeps its edits
    Discard,
}

/// What `resolve_go_online` started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceOutcome {
    Syncing(JobHandle),
    Switching,
}

type AttachResult = Result<ServiceSchema, RemoteError>;

/// Owner of the current `SyncMode`
pub struct SyncModeController {
    mode_tx: watch::Sender<SyncMode>,
    runner: JobRunner,
    job_rx: mpsc::UnboundedReceiver<JobEvent>,
    attach_tx: mpsc::UnboundedSender<AttachResult>,
    attach_rx: mpsc::UnboundedReceiver<AttachResult>,
    attaching: bool,
    manager: LocalStoreManager,
    orchestrator: SyncOrchestrator,
    ledger: EditLedger,
    events: EventBus,
    remote: Arc<dyn FeatureService>,
    session: SessionFile,
    pending_choice: bool,
    switch_after_sync: Option<JobHandle>,
    live_schema: Option<ServiceSchema>,
}

impl SyncModeController {
    pub fn new(config: &Config, remote: Arc<dyn FeatureService>) -> Self {
        Self::with_background(config, remote, Arc::new(NoBackground))
    }

    /// Controller whose jobs register with a platform background facility
    pub fn with_background(
        config: &Config,
        remote: Arc<dyn FeatureService>,
        background: Arc<dyn BackgroundExecution>,
    ) -> Self {
        let (runner, job_rx) = JobRunner::with_receiver(background);
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let (mode_tx, _) = watch::channel(SyncMode::Live);
        let events = EventBus::new();

        Self {
            mode_tx,
            runner,
            job_rx,
            attach_tx,
            attach_rx,
            attaching: false,
            manager: LocalStoreManager::new(config.store_path(), remote.clone()),
            orchestrator: SyncOrchestrator::new(remote.clone()),
            ledger: EditLedger::with_events(events.clone()),
            events,
            remote,
            session: SessionFile::new(config.session_path()),
            pending_choice: false,
            switch_after_sync: None,
            live_schema: None,
        }
    }

    // ---- Observation ----

    pub fn mode(&self) -> SyncMode {
        *self.mode_tx.borrow()
    }

    /// Receiver that always holds the current mode
    pub fn watch_mode(&self) -> watch::Receiver<SyncMode> {
        self.mode_tx.subscribe()
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn ledger(&self) -> &EditLedger {
        &self.ledger
    }

    pub fn pending_edit_count(&self) -> usize {
        self.ledger.pending_count()
    }

    pub fn has_local_edits(&self) -> bool {
        self.ledger.has_local_edits()
    }

    pub fn local_store(&self) -> Option<&LocalStore> {
        self.manager.current()
    }

    pub fn last_sync_result(&self) -> Option<&SyncResult> {
        self.orchestrator.last_result()
    }

    /// Schema of the live layers attached by the last switch to `Live`
    pub fn live_schema(&self) -> Option<&ServiceSchema> {
        self.live_schema.as_ref()
    }

    pub fn is_choice_pending(&self) -> bool {
        self.pending_choice
    }

    /// The job of `kind` in flight and its last known status
    pub fn job(&self, kind: JobKind) -> Option<(JobHandle, JobStatus)> {
        let handle = self.runner.in_flight(kind)?;
        let status = self.runner.status(handle)?;
        Some((handle, status))
    }

    /// True when no job, transition or live attach is outstanding
    pub fn is_idle(&self) -> bool {
        !self.mode().is_transient() && !self.runner.any_in_flight() && !self.attaching
    }

    // ---- Relaunch ----

    /// Recover after a relaunch
    ///
    /// Removes leftovers of interrupted downloads, picks up an existing
    /// replica, recomputes the ledger from its change tracking and resumes
    /// `Local` if that was the last stable mode.
    pub fn restore(&mut self) -> Result<SyncMode, SyncError> {
        let mode = self.mode();
        if mode != SyncMode::Live {
            return Err(PreconditionViolation::WrongMode {
                operation: "restore",
                mode,
            }
            .into());
        }
        if self.runner.any_in_flight() {
            return Err(PreconditionViolation::StoreBusy.into());
        }

        for path in self.manager.clean_stale()? {
            info!(path = ?path, "Removed stale local store file");
        }

        let session = match self.session.load() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session file");
                None
            }
        };
        if let Err(e) = self.manager.detect() {
            warn!(error = %e, "Existing local store is unusable");
        }

        let pending = match self.manager.current() {
            Some(store) => store.pending_edits()?,
            None => Vec::new(),
        };
        self.ledger.seed(pending);

        let resume_local = session.is_some_and(|s| s.mode == SyncMode::Local)
            && self.manager.current().is_some();
        if resume_local {
            self.manager.set_open(true);
            self.set_mode(SyncMode::Local);
        } else {
            self.save_session(SyncMode::Live);
        }

        info!(
            mode = %self.mode(),
            pending_edits = self.ledger.pending_count(),
            "Session restored"
        );
        Ok(self.mode())
    }

    // ---- Transitions ----

    /// Take `aoi` offline: `Live` → `GoingLocal`
    pub fn go_offline(
        &mut self,
        aoi: Extent,
        options: DownloadOptions,
    ) -> Result<JobHandle, SyncError> {
        self.require_mode(SyncMode::Live, "go offline")?;
        let handle = self.manager.download(&mut self.runner, aoi, options)?;
        self.set_mode(SyncMode::GoingLocal);
        Ok(handle)
    }

    /// Switch back to live data
    ///
    /// With pending edits nothing transitions; the caller must resolve the
    /// choice first.
    pub fn go_online(&mut self) -> Result<GoOnline, SyncError> {
        self.require_mode(SyncMode::Local, "go online")?;
        if self.pending_choice {
            return Err(PreconditionViolation::ChoicePending.into());
        }
        if self.runner.in_flight(JobKind::Upload).is_some() {
            return Err(PreconditionViolation::JobInFlight(JobKind::Upload).into());
        }

        if self.ledger.has_local_edits() {
            let pending_edits = self.ledger.pending_count();
            self.pending_choice = true;
            self.events.emit(SyncEvent::ChoiceRequired { pending_edits });
            info!(pending_edits, "Going online needs a decision about pending edits");
            return Ok(GoOnline::ChoiceRequired { pending_edits });
        }

        self.begin_going_live();
        Ok(GoOnline::Switching)
    }

    /// Resolve the choice raised by `go_online`
    pub fn resolve_go_online(&mut self, choice: OnlineChoice) -> Result<ChoiceOutcome, SyncError> {
        if !self.pending_choice {
            return Err(PreconditionViolation::NoPendingChoice.into());
        }
        self.require_mode(SyncMode::Local, "go online")?;

        match choice {
            OnlineChoice::SyncThenSwitch => {
                let handle = self.start_upload()?;
                self.pending_choice = false;
                self.switch_after_sync = Some(handle);
                Ok(ChoiceOutcome::Syncing(handle))
            }
            OnlineChoice::Discard => {
                self.pending_choice = false;
                info!(
                    pending_edits = self.ledger.pending_count(),
                    "Switching to live data; pending edits stay in the local store"
                );
                self.begin_going_live();
                Ok(ChoiceOutcome::Switching)
            }
        }
    }

    // ---- Local work ----

    /// Upload pending edits; the mode stays `Local`
    pub fn sync_now(&mut self) -> Result<JobHandle, SyncError> {
        self.require_mode(SyncMode::Local, "sync")?;
        if self.pending_choice {
            return Err(PreconditionViolation::ChoicePending.into());
        }
        self.start_upload()
    }

    /// Write to the replica and mirror the change in the ledger
    pub fn apply_edit(&mut self, edit: &LocalEdit) -> Result<RowKey, SyncError> {
        let mode = self.mode();
        if mode != SyncMode::Local {
            return Err(PreconditionViolation::NotEditable(format!("in {} mode", mode)).into());
        }
        if self.runner.in_flight(JobKind::Upload).is_some() {
            return Err(PreconditionViolation::NotEditable("syncing".to_string()).into());
        }

        let store = self
            .manager
            .current_mut()
            .ok_or(PreconditionViolation::NoLocalStore)?;
        let applied = store.apply(edit)?;
        self.ledger.apply(&applied.mutations);
        debug!(row = %applied.key, "Local edit applied");
        Ok(applied.key)
    }

    /// Delete the replica; only allowed in `Live` with nothing running
    pub fn delete_local_store(&mut self) -> Result<(), SyncError> {
        if self.mode().references_local_store() {
            return Err(PreconditionViolation::StoreOpen.into());
        }
        self.manager.delete(&self.runner, &mut self.ledger)
    }

    /// Request cancellation of the running download
    pub fn cancel_download(&mut self) -> bool {
        self.cancel(JobKind::Download)
    }

    /// Request cancellation of the running upload
    pub fn cancel_sync(&mut self) -> bool {
        self.cancel(JobKind::Upload)
    }

    // ---- Event processing ----

    /// Wait for the next job or live-attach message and process it
    ///
    /// Waits indefinitely when idle; see `is_idle`.
    pub async fn next_event(&mut self) {
        tokio::select! {
            Some(event) = self.job_rx.recv() => self.handle_job_event(event),
            Some(result) = self.attach_rx.recv() => self.handle_live_attached(result),
        }
    }

    /// Process events until nothing is outstanding
    pub async fn run_until_idle(&mut self) {
        while !self.is_idle() {
            self.next_event().await;
        }
    }

    fn handle_job_event(&mut self, event: JobEvent) {
        self.runner.observe(&event);
        match event {
            JobEvent::Progress {
                handle,
                fraction,
                message,
            } => self.events.emit(SyncEvent::JobProgress {
                job: handle.id,
                kind: handle.kind,
                fraction,
                message,
            }),
            JobEvent::Resumed { handle } => {
                debug!(job = %handle.id, kind = %handle.kind, "Job resumed by the platform");
            }
            JobEvent::Completed { handle, outcome } => {
                self.runner.complete(handle);
                match handle.kind {
                    JobKind::Download => self.handle_download_completed(handle, outcome),
                    JobKind::Upload => self.handle_upload_completed(handle, outcome),
                }
            }
        }
    }

    fn handle_download_completed(&mut self, handle: JobHandle, outcome: JobOutcome) {
        let resolution = self.manager.finish_download(outcome, &mut self.ledger);
        let summary = match &resolution {
            DownloadResolution::Installed { .. } => OutcomeSummary::succeeded(),
            DownloadResolution::Failed(e) => OutcomeSummary::Failed {
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
            DownloadResolution::Cancelled => OutcomeSummary::Cancelled,
        };
        self.events.emit(SyncEvent::JobCompleted {
            job: handle.id,
            kind: handle.kind,
            outcome: summary,
        });

        if self.mode() != SyncMode::GoingLocal {
            warn!(job = %handle.id, mode = %self.mode(), "Download finished outside a transition");
            self.manager.set_open(false);
            return;
        }
        match resolution {
            DownloadResolution::Installed {
                reused,
                pending_edits,
                ..
            } => {
                if reused {
                    self.events.emit(SyncEvent::LocalDataFound { pending_edits });
                }
                self.set_mode(SyncMode::Local);
            }
            DownloadResolution::Failed(_) | DownloadResolution::Cancelled => {
                self.set_mode(SyncMode::Live);
            }
        }
    }

    fn handle_upload_completed(&mut self, handle: JobHandle, outcome: JobOutcome) {
        let resolution =
            self.orchestrator
                .finish_sync(outcome, self.manager.current_mut(), &mut self.ledger);
        let summary = match &resolution {
            SyncResolution::Completed(result) => OutcomeSummary::Succeeded {
                feature_errors: result.per_feature_errors.len(),
                attachment_errors: result.per_attachment_errors.len(),
            },
            SyncResolution::Failed(e) => OutcomeSummary::Failed {
                message: e.to_string(),
                retryable: e.is_retryable(),
            },
            SyncResolution::Cancelled => OutcomeSummary::Cancelled,
        };
        self.events.emit(SyncEvent::JobCompleted {
            job: handle.id,
            kind: handle.kind,
            outcome: summary,
        });

        if self.switch_after_sync != Some(handle) {
            return;
        }
        self.switch_after_sync = None;
        match resolution {
            SyncResolution::Completed(_) if self.mode() == SyncMode::Local => {
                self.begin_going_live();
            }
            _ => info!(job = %handle.id, "Upload did not complete; staying in local mode"),
        }
    }

    fn handle_live_attached(&mut self, result: AttachResult) {
        self.attaching = false;
        if self.mode() != SyncMode::GoingLive {
            debug!(mode = %self.mode(), "Ignoring live attach outside a transition");
            return;
        }
        match result {
            Ok(schema) => {
                info!(layers = schema.layers.len(), "Live layers attached");
                self.live_schema = Some(schema);
                self.manager.set_open(false);
                self.set_mode(SyncMode::Live);
            }
            Err(e) => {
                warn!(error = %e, "Live layers could not be attached, returning to local data");
                self.set_mode(SyncMode::Local);
            }
        }
    }

    // ---- Helpers ----

    fn require_mode(&self, expected: SyncMode, operation: &'static str) -> Result<(), SyncError> {
        let mode = self.mode();
        if mode.is_transient() {
            return Err(PreconditionViolation::TransitionInFlight(mode).into());
        }
        if mode != expected {
            return Err(PreconditionViolation::WrongMode { operation, mode }.into());
        }
        Ok(())
    }

    fn start_upload(&mut self) -> Result<JobHandle, SyncError> {
        let store = self
            .manager
            .current()
            .ok_or(PreconditionViolation::NoLocalStore)?;
        self.orchestrator.sync_now(&mut self.runner, store)
    }

    /// `Local` → `GoingLive`: attach live layers off the coordination task
    fn begin_going_live(&mut self) {
        self.set_mode(SyncMode::GoingLive);
        self.attaching = true;

        let remote = self.remote.clone();
        let attach_tx = self.attach_tx.clone();
        tokio::spawn(async move {
            let _ = attach_tx.send(remote.fetch_schema().await);
        });
    }

    fn cancel(&mut self, kind: JobKind) -> bool {
        match self.runner.in_flight(kind) {
            Some(handle) => self.runner.cancel(handle),
            None => false,
        }
    }

    fn set_mode(&mut self, mode: SyncMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous == mode {
            return;
        }
        info!(from = %previous, to = %mode, "Mode changed");
        self.events.emit(SyncEvent::ModeChanged { mode });
        self.save_session(mode);
    }

    fn save_session(&self, mode: SyncMode) {
        if let Err(e) = self.session.save(mode) {
            warn!(error = %e, "Failed to save session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeFeatureService;
    use serde_json::{json, Map};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        temp_dir: TempDir,
        remote: Arc<FakeFeatureService>,
        controller: SyncModeController,
    }

    impl Harness {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let remote = Arc::new(FakeFeatureService::new());
            let controller = SyncModeController::new(&config(&temp_dir), remote.clone());
            Self {
                temp_dir,
                remote,
                controller,
            }
        }

        /// A fresh controller over the same data directory
        fn relaunch(self) -> Self {
            let Harness {
                temp_dir,
                remote,
                controller,
            } = self;
            drop(controller);
            let controller = SyncModeController::new(&config(&temp_dir), remote.clone());
            Self {
                temp_dir,
                remote,
                controller,
            }
        }

        async fn settle(&mut self) {
            tokio::time::timeout(Duration::from_secs(5), self.controller.run_until_idle())
                .await
                .expect("controller did not settle");
        }

        async fn offline(&mut self) {
            self.controller
                .go_offline(aoi(), DownloadOptions::default())
                .unwrap();
            self.settle().await;
            assert_eq!(self.controller.mode(), SyncMode::Local);
        }
    }

    fn config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn aoi() -> Extent {
        Extent::new(-120.0, 30.0, -110.0, 40.0).unwrap()
    }

    fn update(id: i64) -> LocalEdit {
        LocalEdit::UpdateFeature {
            layer: 0,
            id,
            attributes: json!({ "status": "inspected" }).as_object().cloned().unwrap(),
            geometry: None,
        }
    }

    fn add() -> LocalEdit {
        LocalEdit::AddFeature {
            layer: 0,
            attributes: Map::new(),
            geometry: Some(json!({ "x": 1.0, "y": 2.0 })),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn modes(events: &[SyncEvent]) -> Vec<SyncMode> {
        events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::ModeChanged { mode } => Some(*mode),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_go_offline_installs_store_for_extent() {
        let mut h = Harness::new();
        let mut rx = h.controller.subscribe();

        h.controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap();
        assert_eq!(h.controller.mode(), SyncMode::GoingLocal);
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        let store = h.controller.local_store().unwrap();
        assert_eq!(store.info().source_extent, aoi());
        assert!(store.is_open());

        let events = drain(&mut rx);
        assert_eq!(modes(&events), vec![SyncMode::GoingLocal, SyncMode::Local]);
        let completed = events
            .iter()
            .position(|e| matches!(e, SyncEvent::JobCompleted { .. }))
            .unwrap();
        let last_progress = events
            .iter()
            .rposition(|e| matches!(e, SyncEvent::JobProgress { .. }))
            .unwrap();
        assert!(last_progress < completed);
    }

    #[tokio::test]
    async fn test_failed_download_rolls_back_to_live() {
        let mut h = Harness::new();
        h.remote
            .fail_download(RemoteError::Unreachable("network down".to_string()));
        let mut rx = h.controller.subscribe();

        h.controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Live);
        assert!(h.controller.local_store().is_none());
        let events = drain(&mut rx);
        assert_eq!(modes(&events), vec![SyncMode::GoingLocal, SyncMode::Live]);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::JobCompleted {
                outcome: OutcomeSummary::Failed { retryable: true, .. },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_cancelled_download_rolls_back_to_live() {
        let mut h = Harness::new();
        let _gate = h.remote.gate_downloads();

        h.controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap();
        assert!(h.controller.cancel_download());
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Live);
        assert!(h.controller.local_store().is_none());
        assert!(!config(&h.temp_dir).store_path().exists());
    }

    #[tokio::test]
    async fn test_second_transition_is_rejected() {
        let mut h = Harness::new();
        let _gate = h.remote.gate_downloads();

        h.controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap();
        let err = h
            .controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap_err();
        assert_eq!(
            err.precondition(),
            Some(&PreconditionViolation::TransitionInFlight(
                SyncMode::GoingLocal
            ))
        );
        let err = h.controller.go_online().unwrap_err();
        assert!(matches!(
            err.precondition(),
            Some(PreconditionViolation::TransitionInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_mode_calls_are_rejected() {
        let mut h = Harness::new();

        assert!(matches!(
            h.controller.go_online().unwrap_err().precondition(),
            Some(PreconditionViolation::WrongMode {
                mode: SyncMode::Live,
                ..
            })
        ));
        assert!(matches!(
            h.controller.sync_now().unwrap_err().precondition(),
            Some(PreconditionViolation::WrongMode { .. })
        ));
        assert!(matches!(
            h.controller.apply_edit(&add()).unwrap_err().precondition(),
            Some(PreconditionViolation::NotEditable(_))
        ));
        assert!(matches!(
            h.controller
                .resolve_go_online(OnlineChoice::Discard)
                .unwrap_err()
                .precondition(),
            Some(PreconditionViolation::NoPendingChoice)
        ));
    }

    #[tokio::test]
    async fn test_clean_sync_zeroes_ledger() {
        let mut h = Harness::new();
        h.offline().await;
        for _ in 0..3 {
            h.controller.apply_edit(&add()).unwrap();
        }
        assert_eq!(h.controller.pending_edit_count(), 3);

        h.controller.sync_now().unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert_eq!(h.controller.pending_edit_count(), 0);
        assert!(!h.controller.has_local_edits());
        assert!(h.controller.last_sync_result().unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_partial_sync_keeps_failed_rows() {
        let mut h = Harness::new();
        h.offline().await;
        for id in 1..=5 {
            h.controller.apply_edit(&update(id)).unwrap();
        }
        h.remote.reject(RowKey::feature(0, 2), "value out of range");
        h.remote.reject(RowKey::feature(0, 5), "value out of range");

        h.controller.sync_now().unwrap();
        h.settle().await;

        assert_eq!(h.controller.pending_edit_count(), 2);
        assert_eq!(
            h.controller.last_sync_result().unwrap().failed_identifiers(),
            vec![RowKey::feature(0, 2), RowKey::feature(0, 5)]
        );
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_local_mode_and_edits() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&update(1)).unwrap();
        h.remote.fail_feature_edits(RemoteError::Server {
            status: 503,
            message: "maintenance".to_string(),
        });

        h.controller.sync_now().unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert_eq!(h.controller.pending_edit_count(), 1);
        assert!(h.controller.last_sync_result().is_none());
    }

    #[tokio::test]
    async fn test_edits_refused_while_syncing() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&update(1)).unwrap();
        let _gate = h.remote.gate_uploads();

        h.controller.sync_now().unwrap();
        let err = h.controller.apply_edit(&update(2)).unwrap_err();
        assert!(matches!(
            err.precondition(),
            Some(PreconditionViolation::NotEditable(_))
        ));
        assert!(matches!(
            h.controller.sync_now().unwrap_err().precondition(),
            Some(PreconditionViolation::JobInFlight(JobKind::Upload))
        ));

        assert!(h.controller.cancel_sync());
        h.settle().await;
        assert_eq!(h.controller.pending_edit_count(), 1);
    }

    #[tokio::test]
    async fn test_go_online_without_edits_switches() {
        let mut h = Harness::new();
        h.offline().await;

        assert_eq!(h.controller.go_online().unwrap(), GoOnline::Switching);
        assert_eq!(h.controller.mode(), SyncMode::GoingLive);
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Live);
        assert!(h.controller.live_schema().is_some());
        assert!(!h.controller.local_store().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_go_online_with_edits_waits_for_choice() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&add()).unwrap();
        let mut rx = h.controller.subscribe();

        assert_eq!(
            h.controller.go_online().unwrap(),
            GoOnline::ChoiceRequired { pending_edits: 1 }
        );
        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert!(h.controller.is_idle());
        assert!(matches!(
            h.controller.go_online().unwrap_err().precondition(),
            Some(PreconditionViolation::ChoicePending)
        ));
        assert!(drain(&mut rx).contains(&SyncEvent::ChoiceRequired { pending_edits: 1 }));

        assert_eq!(
            h.controller
                .resolve_go_online(OnlineChoice::Discard)
                .unwrap(),
            ChoiceOutcome::Switching
        );
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Live);
        // The replica keeps its edits until deleted
        assert_eq!(h.controller.pending_edit_count(), 1);
        assert_eq!(
            h.controller.local_store().unwrap().pending_edit_count().unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_sync_then_switch() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&update(3)).unwrap();
        h.controller.go_online().unwrap();

        let outcome = h
            .controller
            .resolve_go_online(OnlineChoice::SyncThenSwitch)
            .unwrap();
        assert!(matches!(outcome, ChoiceOutcome::Syncing(_)));
        assert_eq!(h.controller.mode(), SyncMode::Local);
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Live);
        assert_eq!(h.controller.pending_edit_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_then_switch_stays_local_on_failure() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&update(3)).unwrap();
        h.controller.go_online().unwrap();
        h.remote
            .fail_feature_edits(RemoteError::Unreachable("offline".to_string()));

        h.controller
            .resolve_go_online(OnlineChoice::SyncThenSwitch)
            .unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert_eq!(h.controller.pending_edit_count(), 1);
        assert!(!h.controller.is_choice_pending());
    }

    #[tokio::test]
    async fn test_failed_live_attach_returns_to_local() {
        let mut h = Harness::new();
        h.offline().await;
        h.remote
            .fail_schema(RemoteError::Unreachable("offline".to_string()));

        h.controller.go_online().unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert!(h.controller.local_store().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_delete_guarded_by_mode() {
        let mut h = Harness::new();
        h.offline().await;

        assert!(matches!(
            h.controller.delete_local_store().unwrap_err().precondition(),
            Some(PreconditionViolation::StoreOpen)
        ));

        h.controller.go_online().unwrap();
        h.settle().await;
        h.controller.delete_local_store().unwrap();

        assert!(h.controller.local_store().is_none());
        assert!(!config(&h.temp_dir).store_path().exists());
    }

    #[tokio::test]
    async fn test_restore_resumes_local_with_pending_edits() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&add()).unwrap();
        h.controller.apply_edit(&update(2)).unwrap();

        let mut h = h.relaunch();
        assert_eq!(h.controller.restore().unwrap(), SyncMode::Local);

        assert!(h.controller.local_store().unwrap().is_open());
        assert_eq!(h.controller.pending_edit_count(), 2);
        h.controller.apply_edit(&update(3)).unwrap();
        assert_eq!(h.controller.pending_edit_count(), 3);
    }

    #[tokio::test]
    async fn test_restore_after_going_live_stays_live() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.go_online().unwrap();
        h.settle().await;

        let mut h = h.relaunch();
        assert_eq!(h.controller.restore().unwrap(), SyncMode::Live);
        let store = h.controller.local_store().unwrap();
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_restore_removes_stale_download_files() {
        let mut h = Harness::new();
        let store_path = config(&h.temp_dir).store_path();
        let staging = crate::storage::StoreFiles::new(&store_path).staging();
        std::fs::write(&staging, b"partial").unwrap();

        assert_eq!(h.controller.restore().unwrap(), SyncMode::Live);
        assert!(!staging.exists());
        assert!(h.controller.local_store().is_none());
    }

    #[tokio::test]
    async fn test_reused_store_reports_local_data_found() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&add()).unwrap();
        h.controller.go_online().unwrap();
        h.controller
            .resolve_go_online(OnlineChoice::Discard)
            .unwrap();
        h.settle().await;
        let mut rx = h.controller.subscribe();

        h.controller
            .go_offline(aoi(), DownloadOptions::default())
            .unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        assert!(drain(&mut rx).contains(&SyncEvent::LocalDataFound { pending_edits: 1 }));
        assert_eq!(h.remote.extract_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_download_after_relaunch_keeps_unsynced_edits() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.apply_edit(&add()).unwrap();
        h.controller.go_online().unwrap();
        h.controller
            .resolve_go_online(OnlineChoice::Discard)
            .unwrap();
        h.settle().await;

        let mut h = h.relaunch();
        let err = h
            .controller
            .go_offline(
                aoi(),
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
        assert_eq!(h.controller.mode(), SyncMode::Live);
        assert_eq!(h.remote.extract_requests().len(), 1);
        let store = h.controller.local_store().unwrap();
        assert_eq!(store.pending_edit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_go_offline_for_other_extent_downloads_it() {
        let mut h = Harness::new();
        h.offline().await;
        h.controller.go_online().unwrap();
        h.settle().await;

        let elsewhere = Extent::new(10.0, 10.0, 20.0, 20.0).unwrap();
        h.controller
            .go_offline(elsewhere, DownloadOptions::default())
            .unwrap();
        h.settle().await;

        assert_eq!(h.controller.mode(), SyncMode::Local);
        let store = h.controller.local_store().unwrap();
        assert_eq!(store.info().source_extent, elsewhere);
        assert_eq!(h.remote.extract_requests().len(), 2);
        assert_eq!(h.remote.extract_requests()[1].extent, elsewhere);
    }

    #[tokio::test]
    async fn test_mode_watch_follows_transitions() {
        let mut h = Harness::new();
        let watch = h.controller.watch_mode();

        h.offline().await;
        assert_eq!(*watch.borrow(), SyncMode::Local);
    }
}
