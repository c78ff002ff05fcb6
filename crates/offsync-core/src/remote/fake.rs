//! Scriptable in-memory feature service for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use super::{
    AttachmentEdit, AttachmentEditResponse, AttachmentRecord, EditOutcome, EditResponse, Extract,
    ExtractRequest, FeatureEdit, FeatureEditResponse, FeatureRecord, FeatureService, LayerInfo,
    RemoteError, ServiceSchema,
};
use crate::models::{LayerId, RowKey};

pub(crate) const FAKE_URL: &str = "https://fake.example.com/FeatureServer";

#[derive(Default)]
struct Script {
    schema_failure: Option<RemoteError>,
    download_failure: Option<RemoteError>,
    feature_failure: Option<RemoteError>,
    attachment_failure: Option<RemoteError>,
    rejections: HashMap<RowKey, String>,
    download_gate: Option<Arc<Notify>>,
    upload_gate: Option<Arc<Notify>>,
}

/// Feature service whose answers are scripted by the test
pub(crate) struct FakeFeatureService {
    schema: ServiceSchema,
    extract: Extract,
    script: Mutex<Script>,
    requests: Mutex<Vec<ExtractRequest>>,
    feature_batches: Mutex<Vec<Vec<FeatureEdit>>>,
    attachment_batches: Mutex<Vec<Vec<AttachmentEdit>>>,
    next_server_id: AtomicI64,
}

impl FakeFeatureService {
    pub(crate) fn new() -> Self {
        let extract = sample_extract();
        Self {
            schema: ServiceSchema {
                layers: extract.layers.clone(),
            },
            extract,
            script: Mutex::new(Script::default()),
            requests: Mutex::new(Vec::new()),
            feature_batches: Mutex::new(Vec::new()),
            attachment_batches: Mutex::new(Vec::new()),
            next_server_id: AtomicI64::new(1000),
        }
    }

    pub(crate) fn fail_schema(&self, error: RemoteError) {
        self.script.lock().unwrap().schema_failure = Some(error);
    }

    pub(crate) fn fail_download(&self, error: RemoteError) {
        self.script.lock().unwrap().download_failure = Some(error);
    }

    pub(crate) fn fail_feature_edits(&self, error: RemoteError) {
        self.script.lock().unwrap().feature_failure = Some(error);
    }

    pub(crate) fn fail_attachment_edits(&self, error: RemoteError) {
        self.script.lock().unwrap().attachment_failure = Some(error);
    }

    /// Reject the edit of `key` with `message`
    pub(crate) fn reject(&self, key: RowKey, message: &str) {
        self.script
            .lock()
            .unwrap()
            .rejections
            .insert(key, message.to_string());
    }

    /// Hold downloads until the returned gate is notified
    pub(crate) fn gate_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script.lock().unwrap().download_gate = Some(gate.clone());
        gate
    }

    /// Hold feature uploads until the returned gate is notified
    pub(crate) fn gate_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script.lock().unwrap().upload_gate = Some(gate.clone());
        gate
    }

    pub(crate) fn extract_requests(&self) -> Vec<ExtractRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn feature_batches(&self) -> Vec<Vec<FeatureEdit>> {
        self.feature_batches.lock().unwrap().clone()
    }

    pub(crate) fn attachment_batches(&self) -> Vec<Vec<AttachmentEdit>> {
        self.attachment_batches.lock().unwrap().clone()
    }

    fn outcome(&self, key: RowKey, is_add: bool) -> EditOutcome {
        let rejection = self.script.lock().unwrap().rejections.get(&key).cloned();
        let server_id = match (&rejection, is_add) {
            (None, true) => Some(self.next_server_id.fetch_add(1, Ordering::SeqCst)),
            _ => None,
        };
        EditOutcome {
            layer: key.table.layer(),
            id: key.id,
            server_id,
            error: rejection,
        }
    }
}

/// Layer 0 "Hydrants" with attachments, five features and one attachment
/// on feature 1; layer 1 "Inspections" without attachments, two features
pub(crate) fn sample_extract() -> Extract {
    let layers = vec![
        LayerInfo {
            id: 0,
            name: "Hydrants".to_string(),
            has_geometry: true,
            supports_attachments: true,
        },
        LayerInfo {
            id: 1,
            name: "Inspections".to_string(),
            has_geometry: false,
            supports_attachments: false,
        },
    ];

    let mut features: Vec<FeatureRecord> = (1..=5)
        .map(|id| FeatureRecord {
            layer: 0,
            id,
            attributes: json!({ "status": "ok", "number": id })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            geometry: Some(json!({ "x": id as f64 * 10.0, "y": 5.0 })),
        })
        .collect();
    features.extend((1..=2).map(|id| FeatureRecord {
        layer: 1,
        id,
        attributes: Default::default(),
        geometry: None,
    }));

    let attachments = vec![AttachmentRecord {
        layer: 0,
        id: 1,
        feature_id: 1,
        name: "front.jpg".to_string(),
        content_type: "image/jpeg".to_string(),
        data: vec![0xff, 0xd8, 0xff],
    }];

    Extract {
        layers,
        features,
        attachments,
    }
}

#[async_trait]
impl FeatureService for FakeFeatureService {
    fn url(&self) -> &str {
        FAKE_URL
    }

    async fn fetch_schema(&self) -> Result<ServiceSchema, RemoteError> {
        if let Some(error) = self.script.lock().unwrap().schema_failure.clone() {
            return Err(error);
        }
        Ok(self.schema.clone())
    }

    async fn download_extract(
        &self,
        request: &ExtractRequest,
        progress: &(dyn Fn(f32, &str) + Send + Sync),
    ) -> Result<Extract, RemoteError> {
        self.requests.lock().unwrap().push(request.clone());
        progress(0.25, "Extracting");

        let gate = self.script.lock().unwrap().download_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.script.lock().unwrap().download_failure.clone() {
            return Err(error);
        }

        let wanted = |layer: LayerId| request.layers.is_empty() || request.layers.contains(&layer);
        let mut extract = self.extract.clone();
        extract.layers.retain(|l| wanted(l.id));
        extract.features.retain(|f| wanted(f.layer));
        if request.return_attachments {
            extract.attachments.retain(|a| wanted(a.layer));
        } else {
            extract.attachments.clear();
        }

        progress(1.0, "Extracted");
        Ok(extract)
    }

    async fn apply_feature_edits(
        &self,
        edits: &[FeatureEdit],
    ) -> Result<FeatureEditResponse, RemoteError> {
        self.feature_batches.lock().unwrap().push(edits.to_vec());

        let gate = self.script.lock().unwrap().upload_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.script.lock().unwrap().feature_failure.clone() {
            return Err(error);
        }

        Ok(EditResponse {
            results: edits
                .iter()
                .map(|edit| self.outcome(edit.key(), matches!(edit, FeatureEdit::Add { .. })))
                .collect(),
        })
    }

    async fn apply_attachment_edits(
        &self,
        edits: &[AttachmentEdit],
    ) -> Result<AttachmentEditResponse, RemoteError> {
        self.attachment_batches.lock().unwrap().push(edits.to_vec());

        if let Some(error) = self.script.lock().unwrap().attachment_failure.clone() {
            return Err(error);
        }

        Ok(EditResponse {
            results: edits
                .iter()
                .map(|edit| self.outcome(edit.key(), matches!(edit, AttachmentEdit::Add { .. })))
                .collect(),
        })
    }
}
