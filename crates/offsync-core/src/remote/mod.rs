//! Remote feature service seam
//!
//! The service is an external capability: fetch its schema, download an
//! extract for an area of interest, apply batches of edits and report
//! per-row results. `HttpFeatureService` is the JSON-over-HTTP rendition.

pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Attributes, Extent, LayerId, RowId, RowKey};

pub use http::HttpFeatureService;

/// Errors talking to the feature service
///
/// These fail a job as a whole. Rejections of single rows are reported in
/// `EditOutcome::error` instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network unreachable, connect failure or timeout
    #[error("Feature service unreachable: {0}")]
    Unreachable(String),

    /// Non-success HTTP status
    #[error("Feature service returned {status}: {message}")]
    Server { status: u16, message: String },

    /// The service (or the device) ran out of storage
    #[error("Storage full while transferring data")]
    StorageFull,

    /// The payload could not be decoded
    #[error("Invalid payload from feature service: {0}")]
    Serialization(String),

    /// No service endpoint is configured
    #[error("No feature service URL configured")]
    NotConfigured,
}

impl RemoteError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Unreachable(_) | RemoteError::StorageFull => true,
            RemoteError::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            RemoteError::Serialization(_) | RemoteError::NotConfigured => false,
        }
    }
}

/// A layer published by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    #[serde(default = "default_true")]
    pub has_geometry: bool,
    #[serde(default)]
    pub supports_attachments: bool,
}

/// Layers of the service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub layers: Vec<LayerInfo>,
}

impl ServiceSchema {
    pub fn layer(&self, id: LayerId) -> Option<&LayerInfo> {
        self.layers.iter().find(|layer| layer.id == id)
    }
}

/// Parameters for generating a local replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub extent: Extent,
    /// Layers to include (empty means every layer)
    pub layers: Vec<LayerId>,
    pub return_attachments: bool,
}

/// A feature row as transferred by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub layer: LayerId,
    pub id: RowId,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub geometry: Option<Value>,
}

/// An attachment row as transferred by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub layer: LayerId,
    pub id: RowId,
    pub feature_id: RowId,
    pub name: String,
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Everything needed to create a replica
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Extract {
    pub layers: Vec<LayerInfo>,
    #[serde(default)]
    pub features: Vec<FeatureRecord>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

/// One feature edit in an upload batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeatureEdit {
    /// `id` is the temporary local id; the service answers with its own
    Add {
        layer: LayerId,
        id: RowId,
        attributes: Attributes,
        geometry: Option<Value>,
    },
    Update {
        layer: LayerId,
        id: RowId,
        attributes: Attributes,
        geometry: Option<Value>,
    },
    Delete {
        layer: LayerId,
        id: RowId,
    },
}

impl FeatureEdit {
    pub fn key(&self) -> RowKey {
        match self {
            FeatureEdit::Add { layer, id, .. }
            | FeatureEdit::Update { layer, id, .. }
            | FeatureEdit::Delete { layer, id } => RowKey::feature(*layer, *id),
        }
    }
}

/// One attachment edit in an upload batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AttachmentEdit {
    Add {
        layer: LayerId,
        id: RowId,
        feature_id: RowId,
        name: String,
        content_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Delete {
        layer: LayerId,
        id: RowId,
    },
}

impl AttachmentEdit {
    pub fn key(&self) -> RowKey {
        match self {
            AttachmentEdit::Add { layer, id, .. } | AttachmentEdit::Delete { layer, id } => {
                RowKey::attachment(*layer, *id)
            }
        }
    }

    /// The feature an added attachment belongs to
    pub fn parent(&self) -> Option<RowKey> {
        match self {
            AttachmentEdit::Add {
                layer, feature_id, ..
            } => Some(RowKey::feature(*layer, *feature_id)),
            AttachmentEdit::Delete { .. } => None,
        }
    }
}

/// Per-row result of applying an edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub layer: LayerId,
    /// The id the edit was sent with
    pub id: RowId,
    /// Id assigned by the service to an added row
    #[serde(default)]
    pub server_id: Option<RowId>,
    /// Rejection message; `None` means the edit was applied
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-row results of one edit batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EditResponse {
    pub results: Vec<EditOutcome>,
}

pub type FeatureEditResponse = EditResponse;
pub type AttachmentEditResponse = EditResponse;

/// The remote feature service
#[async_trait]
pub trait FeatureService: Send + Sync {
    /// Endpoint identifying the service
    fn url(&self) -> &str;

    async fn fetch_schema(&self) -> Result<ServiceSchema, RemoteError>;

    /// Progress is reported as a fraction in `0.0..=1.0`
    async fn download_extract(
        &self,
        request: &ExtractRequest,
        progress: &(dyn Fn(f32, &str) + Send + Sync),
    ) -> Result<Extract, RemoteError>;

    async fn apply_feature_edits(
        &self,
        edits: &[FeatureEdit],
    ) -> Result<FeatureEditResponse, RemoteError>;

    async fn apply_attachment_edits(
        &self,
        edits: &[AttachmentEdit],
    ) -> Result<AttachmentEditResponse, RemoteError>;
}

fn default_true() -> bool {
    true
}

/// Attachment payloads travel as base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
