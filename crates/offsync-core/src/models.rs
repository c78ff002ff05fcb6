//! Data models shared by the sync components
//!
//! Row identities, edit kinds, the area-of-interest extent and the
//! outcome of an upload job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Identifier of a layer in the feature service
pub type LayerId = u32;

/// Identifier of a row within a table
///
/// Rows added locally get negative ids until the service assigns one.
pub type RowId = i64;

/// Feature attributes keyed by field name
pub type Attributes = Map<String, Value>;

/// A local table whose rows are tracked for pending edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "table", content = "layer", rename_all = "snake_case")]
pub enum TableKey {
    /// Feature rows of a layer
    Features(LayerId),
    /// Attachment rows of a layer
    Attachments(LayerId),
}

impl TableKey {
    pub fn layer(&self) -> LayerId {
        match self {
            TableKey::Features(layer) | TableKey::Attachments(layer) => *layer,
        }
    }

    /// Short name used in the durable change-tracking table
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            TableKey::Features(_) => "features",
            TableKey::Attachments(_) => "attachments",
        }
    }

    pub(crate) fn from_parts(kind: &str, layer: LayerId) -> Option<Self> {
        match kind {
            "features" => Some(TableKey::Features(layer)),
            "attachments" => Some(TableKey::Attachments(layer)),
            _ => None,
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Features(layer) => write!(f, "layer {}", layer),
            TableKey::Attachments(layer) => write!(f, "layer {} attachments", layer),
        }
    }
}

/// Identifies one row: the unit of edit tracking and of per-row errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub table: TableKey,
    pub id: RowId,
}

impl RowKey {
    pub fn feature(layer: LayerId, id: RowId) -> Self {
        Self {
            table: TableKey::Features(layer),
            id,
        }
    }

    pub fn attachment(layer: LayerId, id: RowId) -> Self {
        Self {
            table: TableKey::Attachments(layer),
            id,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.table, self.id)
    }
}

/// Kind of a pending local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    Add,
    Update,
    Delete,
}

impl EditKind {
    /// Combine an existing pending edit with a new one on the same row
    ///
    /// Returns `None` when the row no longer differs from the service
    /// (a row added and deleted locally never existed remotely).
    pub fn merge(previous: Option<EditKind>, next: EditKind) -> Option<EditKind> {
        match (previous, next) {
            (None, next) => Some(next),
            (Some(EditKind::Add), EditKind::Update) => Some(EditKind::Add),
            (Some(EditKind::Add), EditKind::Delete) => None,
            (Some(EditKind::Add), EditKind::Add) => Some(EditKind::Add),
            (Some(EditKind::Update), EditKind::Delete) => Some(EditKind::Delete),
            (Some(EditKind::Update), _) => Some(EditKind::Update),
            // A deleted row cannot be edited again
            (Some(EditKind::Delete), _) => Some(EditKind::Delete),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EditKind::Add => "add",
            EditKind::Update => "update",
            EditKind::Delete => "delete",
        }
    }
}

impl FromStr for EditKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(EditKind::Add),
            "update" => Ok(EditKind::Update),
            "delete" => Ok(EditKind::Delete),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown edit kind '{}'",
                other
            ))),
        }
    }
}

/// Pending state of a row after a local write
///
/// `pending == None` means the row is no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMutation {
    pub key: RowKey,
    pub pending: Option<EditKind>,
}

/// Rectangular area of interest used to generate a local replica
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    /// Create an extent, rejecting inverted or non-finite bounds
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self, SyncError> {
        let finite = [xmin, ymin, xmax, ymax].iter().all(|v| v.is_finite());
        if !finite || xmin >= xmax || ymin >= ymax {
            return Err(SyncError::InvalidArgument(format!(
                "invalid extent ({}, {}, {}, {})",
                xmin, ymin, xmax, ymax
            )));
        }
        Ok(Self {
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    /// Extent covering the whole Web Mercator world
    pub fn world() -> Self {
        const HALF: f64 = 20_037_508.342_789_244;
        Self {
            xmin: -HALF,
            ymin: -HALF,
            xmax: HALF,
            ymax: HALF,
        }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.xmin, self.ymin, self.xmax, self.ymax)
    }
}

impl FromStr for Extent {
    type Err = SyncError;

    /// Parse `xmin,ymin,xmax,ymax`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values: Vec<f64> = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| SyncError::InvalidArgument(format!("invalid extent '{}': {}", s, e)))?;

        match values.as_slice() {
            [xmin, ymin, xmax, ymax] => Extent::new(*xmin, *ymin, *xmax, *ymax),
            _ => Err(SyncError::InvalidArgument(format!(
                "extent '{}' must have four comma-separated values",
                s
            ))),
        }
    }
}

/// A local write requested by the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    AddFeature {
        layer: LayerId,
        attributes: Attributes,
        geometry: Option<Value>,
    },
    UpdateFeature {
        layer: LayerId,
        id: RowId,
        attributes: Attributes,
        geometry: Option<Value>,
    },
    DeleteFeature {
        layer: LayerId,
        id: RowId,
    },
    AddAttachment {
        layer: LayerId,
        feature_id: RowId,
        name: String,
        content_type: String,
        data: Vec<u8>,
    },
    DeleteAttachment {
        layer: LayerId,
        id: RowId,
    },
}

/// A temporary local id replaced by the id the service assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRemap {
    pub table: TableKey,
    pub local_id: RowId,
    pub server_id: RowId,
}

/// Semantic rejection of one edit by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditError {
    pub identifier: RowKey,
    pub message: String,
}

/// Outcome of an upload job
///
/// Row-level rejections live here; a populated list does not make the
/// job fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub per_feature_errors: Vec<EditError>,
    pub per_attachment_errors: Vec<EditError>,
    /// Rows the service accepted
    pub applied: Vec<RowKey>,
    /// Attachment edits held back because their feature was rejected
    pub deferred_attachments: Vec<RowKey>,
    pub completed_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn new() -> Self {
        Self {
            per_feature_errors: Vec::new(),
            per_attachment_errors: Vec::new(),
            applied: Vec::new(),
            deferred_attachments: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    /// True when every pending edit reached the service and was accepted
    pub fn is_clean(&self) -> bool {
        self.per_feature_errors.is_empty()
            && self.per_attachment_errors.is_empty()
            && self.deferred_attachments.is_empty()
    }

    /// Identifiers of every rejected row
    pub fn failed_identifiers(&self) -> Vec<RowKey> {
        self.per_feature_errors
            .iter()
            .chain(self.per_attachment_errors.iter())
            .map(|e| e.identifier)
            .collect()
    }
}

impl Default for SyncResult {
    fn default() -> Self {
        Self::new()
    }
}
