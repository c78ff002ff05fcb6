//! Upload of local edits
//!
//! An upload runs in two phases with a fixed order:
//!
//! 1. feature edits
//! 2. attachment edits, once phase 1 has answered, with parent ids rewritten
//!    to the ids the service assigned in phase 1
//!
//! A transport failure in phase 1 fails the job and leaves every edit
//! pending. Row rejections are data in `SyncResult`; the ledger is then
//! cleared only for the rows the service accepted.
//!
//! The job commits before each request goes out. A cancel that arrives
//! while a request is in flight is ignored and the answer is reconciled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::SyncError;
use crate::job::{
    JobContext, JobError, JobHandle, JobKind, JobOutcome, JobOutput, JobRunner, UploadOutput,
};
use crate::ledger::EditLedger;
use crate::models::{EditError, IdRemap, LayerId, RowId, RowKey, SyncResult};
use crate::remote::{AttachmentEdit, EditResponse, FeatureEdit, FeatureService};
use crate::storage::LocalStore;

/// What became of a finished upload job
#[derive(Debug)]
pub enum SyncResolution {
    /// The upload ran; row rejections are inside the result
    Completed(SyncResult),
    Failed(JobError),
    Cancelled,
}

/// Pushes the replica's pending edits to the feature service
pub struct SyncOrchestrator {
    remote: Arc<dyn FeatureService>,
    last_result: Option<SyncResult>,
}

impl SyncOrchestrator {
    pub fn new(remote: Arc<dyn FeatureService>) -> Self {
        Self {
            remote,
            last_result: None,
        }
    }

    /// Result of the most recent completed upload
    pub fn last_result(&self) -> Option<&SyncResult> {
        self.last_result.as_ref()
    }

    /// Start an upload of everything `store` tracks as pending
    ///
    /// Both batches are read up front so the job never touches the replica.
    pub fn sync_now(
        &mut self,
        runner: &mut JobRunner,
        store: &LocalStore,
    ) -> Result<JobHandle, SyncError> {
        let features = store.feature_edit_batch()?;
        let attachments = store.attachment_edit_batch()?;
        let remote = self.remote.clone();

        info!(
            features = features.len(),
            attachments = attachments.len(),
            "Starting upload"
        );
        let handle = runner.start(JobKind::Upload, move |ctx| {
            upload_edits(ctx, remote, features, attachments)
        })?;
        Ok(handle)
    }

    /// Reconcile the replica and the ledger with a finished upload
    pub fn finish_sync(
        &mut self,
        outcome: JobOutcome,
        store: Option<&mut LocalStore>,
        ledger: &mut EditLedger,
    ) -> SyncResolution {
        let output = match outcome {
            JobOutcome::Succeeded(JobOutput::Upload(output)) => output,
            JobOutcome::Succeeded(JobOutput::Download(_)) => {
                return SyncResolution::Failed(JobError::Aborted(
                    "upload job produced a download result".to_string(),
                ))
            }
            JobOutcome::Failed(e) => {
                warn!(error = %e, "Upload failed, edits remain pending");
                return SyncResolution::Failed(e);
            }
            JobOutcome::Cancelled => return SyncResolution::Cancelled,
        };

        let Some(store) = store else {
            return SyncResolution::Failed(JobError::Aborted(
                "local store was removed during upload".to_string(),
            ));
        };
        if let Err(e) = store.mark_applied(&output.result.applied, &output.remaps) {
            warn!(error = %e, "Accepted edits could not be recorded in the local store");
            return SyncResolution::Failed(JobError::Store(e));
        }

        let result = output.result;
        if result.is_clean() {
            ledger.reset();
        } else {
            ledger.clear_rows(&result.applied);
        }

        info!(
            applied = result.applied.len(),
            feature_errors = result.per_feature_errors.len(),
            attachment_errors = result.per_attachment_errors.len(),
            deferred = result.deferred_attachments.len(),
            "Upload reconciled"
        );
        self.last_result = Some(result.clone());
        SyncResolution::Completed(result)
    }
}

/// Body of an upload job
async fn upload_edits(
    ctx: JobContext,
    remote: Arc<dyn FeatureService>,
    features: Vec<FeatureEdit>,
    attachments: Vec<AttachmentEdit>,
) -> Result<JobOutput, JobError> {
    let mut result = SyncResult::new();
    let mut remaps = Vec::new();
    let mut rejected_features = HashSet::new();
    let mut features_applied = false;

    if !features.is_empty() {
        ctx.report(0.0, format!("Uploading {} feature edit(s)", features.len()));
        // Once sent, the service may apply the edits whether or not we wait
        // for the answer, so a cancel must not drop the request
        ctx.commit()?;
        let response = remote.apply_feature_edits(&features).await?;
        features_applied = true;

        let sent = features
            .iter()
            .map(|edit| (edit.key(), matches!(edit, FeatureEdit::Add { .. })));
        rejected_features = reconcile(
            sent,
            &response,
            RowKey::feature,
            &mut result.per_feature_errors,
            &mut result.applied,
            &mut remaps,
        );
    }

    let feature_ids: HashMap<(LayerId, RowId), RowId> = remaps
        .iter()
        .map(|remap| ((remap.table.layer(), remap.local_id), remap.server_id))
        .collect();

    let mut sendable = Vec::with_capacity(attachments.len());
    for mut edit in attachments {
        match edit.parent() {
            Some(parent) if rejected_features.contains(&parent) => {
                result.deferred_attachments.push(edit.key());
            }
            _ => {
                if let AttachmentEdit::Add {
                    layer, feature_id, ..
                } = &mut edit
                {
                    if let Some(server_id) = feature_ids.get(&(*layer, *feature_id)) {
                        *feature_id = *server_id;
                    }
                }
                sendable.push(edit);
            }
        }
    }

    if !sendable.is_empty() {
        ctx.commit()?;
        ctx.report(0.5, format!("Uploading {} attachment edit(s)", sendable.len()));
        match remote.apply_attachment_edits(&sendable).await {
            Ok(response) => {
                let sent = sendable
                    .iter()
                    .map(|edit| (edit.key(), matches!(edit, AttachmentEdit::Add { .. })));
                reconcile(
                    sent,
                    &response,
                    RowKey::attachment,
                    &mut result.per_attachment_errors,
                    &mut result.applied,
                    &mut remaps,
                );
            }
            // Feature edits already landed, so the job cannot fail as a whole
            Err(e) if features_applied => {
                warn!(job = %ctx.handle().id, error = %e, "Attachment upload failed after feature edits applied");
                let message = e.to_string();
                result
                    .per_attachment_errors
                    .extend(sendable.iter().map(|edit| EditError {
                        identifier: edit.key(),
                        message: message.clone(),
                    }));
            }
            Err(e) => return Err(e.into()),
        }
    }

    result.completed_at = chrono::Utc::now();
    Ok(JobOutput::Upload(UploadOutput { result, remaps }))
}

/// Match per-row outcomes to the edits that were sent
///
/// Rows the service did not answer for count as rejected. Returns the keys
/// of every rejected row.
fn reconcile(
    sent: impl Iterator<Item = (RowKey, bool)>,
    response: &EditResponse,
    key_of: fn(LayerId, RowId) -> RowKey,
    errors: &mut Vec<EditError>,
    applied: &mut Vec<RowKey>,
    remaps: &mut Vec<IdRemap>,
) -> HashSet<RowKey> {
    let outcomes: HashMap<RowKey, _> = response
        .results
        .iter()
        .map(|outcome| (key_of(outcome.layer, outcome.id), outcome))
        .collect();

    let mut rejected = HashSet::new();
    for (key, is_add) in sent {
        match outcomes.get(&key) {
            None => {
                errors.push(EditError {
                    identifier: key,
                    message: "No result returned for this edit".to_string(),
                });
                rejected.insert(key);
            }
            Some(outcome) => match &outcome.error {
                Some(message) => {
                    errors.push(EditError {
                        identifier: key,
                        message: message.clone(),
                    });
                    rejected.insert(key);
                }
                None => {
                    applied.push(key);
                    if let (true, Some(server_id)) = (is_add, outcome.server_id) {
                        remaps.push(IdRemap {
                            table: key.table,
                            local_id: key.id,
                            server_id,
                        });
                    }
                }
            },
        }
    }
    rejected
}
