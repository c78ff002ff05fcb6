//! The on-device replica
//!
//! A replica is a SQLite file created from an `Extract`. Every local write
//! goes through `LocalStore`, which records the edit in `pending_edits` in
//! the same transaction and returns the resulting `RowMutation`s.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::schema::{self, SCHEMA_VERSION};
use crate::models::{
    Attributes, EditKind, Extent, IdRemap, LayerId, LocalEdit, RowId, RowKey, RowMutation,
    TableKey,
};
use crate::remote::{
    AttachmentEdit, AttachmentRecord, Extract, FeatureEdit, FeatureRecord, LayerInfo,
};

/// Provenance of a replica, written when it is created
#[derive(Debug, Clone, PartialEq)]
pub struct StoreMetadata {
    pub service_url: String,
    pub extent: Extent,
    pub created_at: DateTime<Utc>,
}

/// Description of an installed replica
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source_extent: Extent,
    pub service_url: String,
}

/// Result of one local write
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEdit {
    /// The row written (for adds, its new temporary id)
    pub key: RowKey,
    /// Tracking changes caused by the write, cascades included
    pub mutations: Vec<RowMutation>,
}

/// Handle to an open replica
///
/// `is_open` is true while the replica backs the current view or a mode
/// transition; only the store manager flips it.
#[derive(Debug)]
pub struct LocalStore {
    conn: Connection,
    info: StoreInfo,
    layers: Vec<LayerInfo>,
    is_open: bool,
}

impl LocalStore {
    /// Write a complete replica to `path`
    ///
    /// All tables are written in one transaction and the completeness
    /// marker is the last row written, so a file without it was
    /// interrupted.
    pub fn create(path: &Path, meta: &StoreMetadata, extract: &Extract) -> StoreResult<StoreInfo> {
        let mut conn = Connection::open(path)?;
        let tx = conn.transaction()?;

        schema::init_schema(&tx)?;
        put_metadata(&tx, "service_url", &meta.service_url)?;
        put_metadata(&tx, "extent", &serde_json::to_string(&meta.extent)?)?;
        put_metadata(&tx, "created_at", &meta.created_at.to_rfc3339())?;

        for layer in &extract.layers {
            tx.execute(
                "INSERT INTO layers (id, name, has_geometry, supports_attachments) VALUES (?1, ?2, ?3, ?4)",
                params![layer.id, layer.name, layer.has_geometry, layer.supports_attachments],
            )?;
        }
        for feature in &extract.features {
            insert_feature(&tx, feature)?;
        }
        for attachment in &extract.attachments {
            insert_attachment(&tx, attachment)?;
        }

        schema::mark_complete(&tx)?;
        tx.commit()?;

        info!(
            path = ?path,
            layers = extract.layers.len(),
            features = extract.features.len(),
            attachments = extract.attachments.len(),
            "Local store written"
        );

        Ok(StoreInfo {
            path: path.to_path_buf(),
            created_at: meta.created_at,
            source_extent: meta.extent,
            service_url: meta.service_url.clone(),
        })
    }

    /// Open an existing replica, verifying that it is complete
    pub fn open(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let incomplete = || StoreError::Incomplete {
            path: path.to_path_buf(),
        };
        match schema::get_schema_version(&conn)? {
            None => return Err(incomplete()),
            Some(found) if found != SCHEMA_VERSION => {
                return Err(StoreError::SchemaMismatch {
                    path: path.to_path_buf(),
                    found,
                    expected: SCHEMA_VERSION,
                })
            }
            Some(_) => {}
        }
        if !schema::is_complete(&conn)? {
            return Err(incomplete());
        }

        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        let service_url = get_metadata(&conn, "service_url")?.ok_or_else(incomplete)?;
        let extent = get_metadata(&conn, "extent")?.ok_or_else(incomplete)?;
        let created_at = get_metadata(&conn, "created_at")?.ok_or_else(incomplete)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|_| incomplete())?
            .with_timezone(&Utc);

        let info = StoreInfo {
            path: path.to_path_buf(),
            created_at,
            source_extent: serde_json::from_str(&extent)?,
            service_url,
        };
        let layers = load_layers(&conn)?;

        debug!(path = ?path, "Opened local store");
        Ok(Self {
            conn,
            info,
            layers,
            is_open: false,
        })
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.info.path
    }

    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        self.is_open = open;
    }

    /// Close the connection, folding the WAL back into the main file
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Database(e))
    }

    // ---- Reads ----

    pub fn feature(&self, layer: LayerId, id: RowId) -> StoreResult<Option<FeatureRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT attributes, geometry FROM features WHERE layer = ?1 AND id = ?2",
                params![layer, id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        row.map(|(attributes, geometry)| feature_record(layer, id, &attributes, geometry))
            .transpose()
    }

    pub fn features(&self, layer: LayerId) -> StoreResult<Vec<FeatureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, attributes, geometry FROM features WHERE layer = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([layer], |row| {
                Ok((
                    row.get::<_, RowId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, attributes, geometry)| feature_record(layer, id, &attributes, geometry))
            .collect()
    }

    pub fn attachments(&self, layer: LayerId, feature_id: RowId) -> StoreResult<Vec<AttachmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, content_type, data FROM attachments
             WHERE layer = ?1 AND feature_id = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![layer, feature_id], |row| {
                Ok(AttachmentRecord {
                    layer,
                    id: row.get(0)?,
                    feature_id,
                    name: row.get(1)?,
                    content_type: row.get(2)?,
                    data: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn feature_count(&self, layer: LayerId) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM features WHERE layer = ?1",
            [layer],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---- Writes ----

    /// Apply a local edit
    pub fn apply(&mut self, edit: &LocalEdit) -> StoreResult<AppliedEdit> {
        match edit {
            LocalEdit::AddFeature {
                layer,
                attributes,
                geometry,
            } => self.add_feature(*layer, attributes, geometry.as_ref()),
            LocalEdit::UpdateFeature {
                layer,
                id,
                attributes,
                geometry,
            } => self.update_feature(*layer, *id, attributes, geometry.as_ref()),
            LocalEdit::DeleteFeature { layer, id } => self.delete_feature(*layer, *id),
            LocalEdit::AddAttachment {
                layer,
                feature_id,
                name,
                content_type,
                data,
            } => self.add_attachment(*layer, *feature_id, name, content_type, data),
            LocalEdit::DeleteAttachment { layer, id } => self.delete_attachment(*layer, *id),
        }
    }

    pub fn add_feature(
        &mut self,
        layer: LayerId,
        attributes: &Attributes,
        geometry: Option<&serde_json::Value>,
    ) -> StoreResult<AppliedEdit> {
        self.require_layer(layer)?;
        let tx = self.conn.transaction()?;

        let id = next_local_id(&tx)?;
        insert_feature(
            &tx,
            &FeatureRecord {
                layer,
                id,
                attributes: attributes.clone(),
                geometry: geometry.cloned(),
            },
        )?;
        let key = RowKey::feature(layer, id);
        let mutation = track(&tx, key, EditKind::Add)?;

        tx.commit()?;
        Ok(AppliedEdit {
            key,
            mutations: vec![mutation],
        })
    }

    pub fn update_feature(
        &mut self,
        layer: LayerId,
        id: RowId,
        attributes: &Attributes,
        geometry: Option<&serde_json::Value>,
    ) -> StoreResult<AppliedEdit> {
        let key = RowKey::feature(layer, id);
        let tx = self.conn.transaction()?;

        let geometry = geometry.map(serde_json::to_string).transpose()?;
        let changed = tx.execute(
            "UPDATE features SET attributes = ?1, geometry = COALESCE(?2, geometry)
             WHERE layer = ?3 AND id = ?4",
            params![serde_json::to_string(attributes)?, geometry, layer, id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRow(key));
        }
        let mutation = track(&tx, key, EditKind::Update)?;

        tx.commit()?;
        Ok(AppliedEdit {
            key,
            mutations: vec![mutation],
        })
    }

    /// Delete a feature together with its attachments
    ///
    /// The service drops attachments with their feature, so attachment rows
    /// are only untracked here, never sent as deletes.
    pub fn delete_feature(&mut self, layer: LayerId, id: RowId) -> StoreResult<AppliedEdit> {
        let key = RowKey::feature(layer, id);
        let tx = self.conn.transaction()?;

        let changed = tx.execute(
            "DELETE FROM features WHERE layer = ?1 AND id = ?2",
            params![layer, id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRow(key));
        }

        let attachment_ids: Vec<RowId> = tx
            .prepare("SELECT id FROM attachments WHERE layer = ?1 AND feature_id = ?2")?
            .query_map(params![layer, id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut mutations = Vec::with_capacity(attachment_ids.len() + 1);
        for attachment_id in attachment_ids {
            let attachment = RowKey::attachment(layer, attachment_id);
            tx.execute(
                "DELETE FROM attachments WHERE layer = ?1 AND id = ?2",
                params![layer, attachment_id],
            )?;
            if untrack(&tx, attachment)? {
                mutations.push(RowMutation {
                    key: attachment,
                    pending: None,
                });
            }
        }
        mutations.push(track(&tx, key, EditKind::Delete)?);

        tx.commit()?;
        Ok(AppliedEdit { key, mutations })
    }

    pub fn add_attachment(
        &mut self,
        layer: LayerId,
        feature_id: RowId,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> StoreResult<AppliedEdit> {
        let info = self.require_layer(layer)?;
        if !info.supports_attachments {
            return Err(StoreError::AttachmentsUnsupported(layer));
        }

        let tx = self.conn.transaction()?;
        let parent_exists = tx
            .prepare("SELECT 1 FROM features WHERE layer = ?1 AND id = ?2")?
            .exists(params![layer, feature_id])?;
        if !parent_exists {
            return Err(StoreError::UnknownRow(RowKey::feature(layer, feature_id)));
        }

        let id = next_local_id(&tx)?;
        insert_attachment(
            &tx,
            &AttachmentRecord {
                layer,
                id,
                feature_id,
                name: name.to_string(),
                content_type: content_type.to_string(),
                data: data.to_vec(),
            },
        )?;
        let key = RowKey::attachment(layer, id);
        let mutation = track(&tx, key, EditKind::Add)?;

        tx.commit()?;
        Ok(AppliedEdit {
            key,
            mutations: vec![mutation],
        })
    }

    pub fn delete_attachment(&mut self, layer: LayerId, id: RowId) -> StoreResult<AppliedEdit> {
        let key = RowKey::attachment(layer, id);
        let tx = self.conn.transaction()?;

        let changed = tx.execute(
            "DELETE FROM attachments WHERE layer = ?1 AND id = ?2",
            params![layer, id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRow(key));
        }
        let mutation = track(&tx, key, EditKind::Delete)?;

        tx.commit()?;
        Ok(AppliedEdit {
            key,
            mutations: vec![mutation],
        })
    }

    // ---- Change tracking ----

    /// Every tracked row, recomputed from durable storage
    pub fn pending_edits(&self) -> StoreResult<Vec<(RowKey, EditKind)>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_kind, layer, row_id, kind FROM pending_edits
             ORDER BY table_kind DESC, layer, row_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, LayerId>(1)?,
                    row.get::<_, RowId>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(table_kind, layer, id, kind)| {
                let table = TableKey::from_parts(&table_kind, layer)?;
                let kind = kind.parse::<EditKind>().ok()?;
                Some((RowKey { table, id }, kind))
            })
            .collect())
    }

    pub fn pending_edit_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_edits", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Feature edits to upload, adds first within each layer
    pub fn feature_edit_batch(&self) -> StoreResult<Vec<FeatureEdit>> {
        let mut batch = Vec::new();
        for (key, kind) in self.pending_edits()? {
            let TableKey::Features(layer) = key.table else {
                continue;
            };
            let edit = match kind {
                EditKind::Delete => FeatureEdit::Delete { layer, id: key.id },
                EditKind::Add | EditKind::Update => {
                    let record = self
                        .feature(layer, key.id)?
                        .ok_or(StoreError::UnknownRow(key))?;
                    if kind == EditKind::Add {
                        FeatureEdit::Add {
                            layer,
                            id: key.id,
                            attributes: record.attributes,
                            geometry: record.geometry,
                        }
                    } else {
                        FeatureEdit::Update {
                            layer,
                            id: key.id,
                            attributes: record.attributes,
                            geometry: record.geometry,
                        }
                    }
                }
            };
            batch.push(edit);
        }
        Ok(batch)
    }

    /// Attachment edits to upload
    pub fn attachment_edit_batch(&self) -> StoreResult<Vec<AttachmentEdit>> {
        let mut batch = Vec::new();
        for (key, kind) in self.pending_edits()? {
            let TableKey::Attachments(layer) = key.table else {
                continue;
            };
            let edit = match kind {
                EditKind::Delete => AttachmentEdit::Delete { layer, id: key.id },
                // Attachments are only ever added whole
                EditKind::Add | EditKind::Update => {
                    let (feature_id, name, content_type, data) = self
                        .conn
                        .query_row(
                            "SELECT feature_id, name, content_type, data FROM attachments
                             WHERE layer = ?1 AND id = ?2",
                            params![layer, key.id],
                            |row| {
                                Ok((
                                    row.get::<_, RowId>(0)?,
                                    row.get::<_, String>(1)?,
                                    row.get::<_, String>(2)?,
                                    row.get::<_, Vec<u8>>(3)?,
                                ))
                            },
                        )
                        .optional()?
                        .ok_or(StoreError::UnknownRow(key))?;
                    AttachmentEdit::Add {
                        layer,
                        id: key.id,
                        feature_id,
                        name,
                        content_type,
                        data,
                    }
                }
            };
            batch.push(edit);
        }
        Ok(batch)
    }

    /// Stop tracking rows the service accepted and adopt its ids
    ///
    /// `applied` holds keys as they were uploaded (temporary ids for adds).
    pub fn mark_applied(&mut self, applied: &[RowKey], remaps: &[IdRemap]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        for key in applied {
            untrack(&tx, *key)?;
        }

        for remap in remaps {
            let layer = remap.table.layer();
            match remap.table {
                TableKey::Features(_) => {
                    tx.execute(
                        "UPDATE features SET id = ?1 WHERE layer = ?2 AND id = ?3",
                        params![remap.server_id, layer, remap.local_id],
                    )?;
                    tx.execute(
                        "UPDATE attachments SET feature_id = ?1 WHERE layer = ?2 AND feature_id = ?3",
                        params![remap.server_id, layer, remap.local_id],
                    )?;
                }
                TableKey::Attachments(_) => {
                    tx.execute(
                        "UPDATE attachments SET id = ?1 WHERE layer = ?2 AND id = ?3",
                        params![remap.server_id, layer, remap.local_id],
                    )?;
                }
            }
            tx.execute(
                "UPDATE pending_edits SET row_id = ?1
                 WHERE table_kind = ?2 AND layer = ?3 AND row_id = ?4",
                params![
                    remap.server_id,
                    remap.table.kind_name(),
                    layer,
                    remap.local_id
                ],
            )?;
        }

        tx.commit()?;
        debug!(
            applied = applied.len(),
            remapped = remaps.len(),
            "Marked edits as applied"
        );
        Ok(())
    }

    fn require_layer(&self, layer: LayerId) -> StoreResult<&LayerInfo> {
        self.layers
            .iter()
            .find(|info| info.id == layer)
            .ok_or(StoreError::UnknownLayer(layer))
    }
}

fn put_metadata(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn get_metadata(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn load_layers(conn: &Connection) -> StoreResult<Vec<LayerInfo>> {
    let mut stmt = conn
        .prepare("SELECT id, name, has_geometry, supports_attachments FROM layers ORDER BY id")?;
    let layers = stmt
        .query_map([], |row| {
            Ok(LayerInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                has_geometry: row.get(2)?,
                supports_attachments: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layers)
}

fn insert_feature(conn: &Connection, feature: &FeatureRecord) -> StoreResult<()> {
    let geometry = feature
        .geometry
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO features (layer, id, attributes, geometry) VALUES (?1, ?2, ?3, ?4)",
        params![
            feature.layer,
            feature.id,
            serde_json::to_string(&feature.attributes)?,
            geometry
        ],
    )?;
    Ok(())
}

fn insert_attachment(conn: &Connection, attachment: &AttachmentRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO attachments (layer, id, feature_id, name, content_type, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            attachment.layer,
            attachment.id,
            attachment.feature_id,
            attachment.name,
            attachment.content_type,
            attachment.data
        ],
    )?;
    Ok(())
}

fn feature_record(
    layer: LayerId,
    id: RowId,
    attributes: &str,
    geometry: Option<String>,
) -> StoreResult<FeatureRecord> {
    Ok(FeatureRecord {
        layer,
        id,
        attributes: serde_json::from_str(attributes)?,
        geometry: geometry.map(|g| serde_json::from_str(&g)).transpose()?,
    })
}

/// Next temporary id: negative and unused by features and attachments
fn next_local_id(tx: &Transaction<'_>) -> StoreResult<RowId> {
    let lowest: Option<RowId> = tx.query_row(
        "SELECT MIN(id) FROM (SELECT id FROM features UNION ALL SELECT id FROM attachments)",
        [],
        |row| row.get(0),
    )?;
    Ok(lowest.unwrap_or(0).min(0) - 1)
}

/// Merge `kind` into the row's pending state
fn track(tx: &Transaction<'_>, key: RowKey, kind: EditKind) -> StoreResult<RowMutation> {
    let kind_name = key.table.kind_name();
    let layer = key.table.layer();

    let previous: Option<String> = tx
        .query_row(
            "SELECT kind FROM pending_edits WHERE table_kind = ?1 AND layer = ?2 AND row_id = ?3",
            params![kind_name, layer, key.id],
            |row| row.get(0),
        )
        .optional()?;
    let previous = previous.and_then(|p| p.parse::<EditKind>().ok());

    let pending = EditKind::merge(previous, kind);
    match pending {
        Some(merged) => {
            tx.execute(
                "INSERT OR REPLACE INTO pending_edits (table_kind, layer, row_id, kind)
                 VALUES (?1, ?2, ?3, ?4)",
                params![kind_name, layer, key.id, merged.as_str()],
            )?;
        }
        None => {
            untrack(tx, key)?;
        }
    }

    Ok(RowMutation { key, pending })
}

/// Drop a row from tracking; returns whether it was tracked
fn untrack(conn: &Connection, key: RowKey) -> StoreResult<bool> {
    let removed = conn.execute(
        "DELETE FROM pending_edits WHERE table_kind = ?1 AND layer = ?2 AND row_id = ?3",
        params![key.table.kind_name(), key.table.layer(), key.id],
    )?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::sample_extract;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta() -> StoreMetadata {
        StoreMetadata {
            service_url: "https://example.com/FeatureServer".to_string(),
            extent: Extent::new(0.0, 0.0, 100.0, 100.0).unwrap(),
            created_at: Utc::now(),
        }
    }

    fn create_store(temp_dir: &TempDir) -> LocalStore {
        let path = temp_dir.path().join("replica.geodatabase");
        LocalStore::create(&path, &meta(), &sample_extract()).unwrap();
        LocalStore::open(&path).unwrap()
    }

    fn attrs(status: &str) -> Attributes {
        json!({ "status": status }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_and_open() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir);

        assert_eq!(store.info().source_extent, meta().extent);
        assert_eq!(store.info().service_url, "https://example.com/FeatureServer");
        assert_eq!(store.layers().len(), 2);
        assert_eq!(store.feature_count(0).unwrap(), 5);
        assert_eq!(store.attachments(0, 1).unwrap().len(), 1);
        assert_eq!(store.pending_edit_count().unwrap(), 0);
        assert!(!store.is_open());
    }

    #[test]
    fn test_open_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = LocalStore::open(&temp_dir.path().join("nope.geodatabase")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_open_incomplete_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("replica.geodatabase");
        {
            let conn = Connection::open(&path).unwrap();
            schema::init_schema(&conn).unwrap();
        }

        let err = LocalStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Incomplete { .. }));
    }

    #[test]
    fn test_open_garbage_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("replica.geodatabase");
        std::fs::write(&path, b"").unwrap();

        let err = LocalStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Incomplete { .. }));
    }

    #[test]
    fn test_add_assigns_negative_ids() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let first = store.add_feature(0, &attrs("new"), None).unwrap();
        let second = store.add_feature(0, &attrs("new"), None).unwrap();

        assert_eq!(first.key, RowKey::feature(0, -1));
        assert_eq!(second.key, RowKey::feature(0, -2));
        assert_eq!(
            first.mutations,
            vec![RowMutation {
                key: first.key,
                pending: Some(EditKind::Add)
            }]
        );
    }

    #[test]
    fn test_add_then_update_stays_add() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let added = store.add_feature(0, &attrs("new"), None).unwrap();
        let updated = store
            .update_feature(0, added.key.id, &attrs("checked"), None)
            .unwrap();

        assert_eq!(updated.mutations[0].pending, Some(EditKind::Add));
        assert_eq!(
            store.pending_edits().unwrap(),
            vec![(added.key, EditKind::Add)]
        );

        let batch = store.feature_edit_batch().unwrap();
        assert!(matches!(&batch[..], [FeatureEdit::Add { attributes, .. }] if attributes["status"] == "checked"));
    }

    #[test]
    fn test_add_then_delete_drops_row() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let added = store.add_feature(0, &attrs("new"), None).unwrap();
        let deleted = store.delete_feature(0, added.key.id).unwrap();

        assert_eq!(deleted.mutations.last().unwrap().pending, None);
        assert_eq!(store.pending_edit_count().unwrap(), 0);
        assert!(store.feature(0, added.key.id).unwrap().is_none());
    }

    #[test]
    fn test_update_then_delete_is_delete() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        store.update_feature(0, 2, &attrs("damaged"), None).unwrap();
        store.delete_feature(0, 2).unwrap();

        assert_eq!(
            store.pending_edits().unwrap(),
            vec![(RowKey::feature(0, 2), EditKind::Delete)]
        );
        assert_eq!(
            store.feature_edit_batch().unwrap(),
            vec![FeatureEdit::Delete { layer: 0, id: 2 }]
        );
    }

    #[test]
    fn test_update_keeps_geometry_when_absent() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        store.update_feature(0, 3, &attrs("painted"), None).unwrap();
        let feature = store.feature(0, 3).unwrap().unwrap();
        assert_eq!(feature.attributes["status"], "painted");
        assert_eq!(feature.geometry, Some(json!({ "x": 30.0, "y": 5.0 })));
    }

    #[test]
    fn test_unknown_rows_and_layers() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        assert!(matches!(
            store.update_feature(0, 99, &attrs("x"), None),
            Err(StoreError::UnknownRow(key)) if key == RowKey::feature(0, 99)
        ));
        assert!(matches!(
            store.add_feature(7, &attrs("x"), None),
            Err(StoreError::UnknownLayer(7))
        ));
        assert!(matches!(
            store.delete_attachment(0, 42),
            Err(StoreError::UnknownRow(_))
        ));
        assert_eq!(store.pending_edit_count().unwrap(), 0);
    }

    #[test]
    fn test_attachments_require_support() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let err = store
            .add_attachment(1, 1, "a.txt", "text/plain", b"a")
            .unwrap_err();
        assert!(matches!(err, StoreError::AttachmentsUnsupported(1)));

        let err = store
            .add_attachment(0, 99, "a.txt", "text/plain", b"a")
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownRow(_)));
    }

    #[test]
    fn test_delete_feature_untracks_its_attachments() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let photo = store
            .add_attachment(0, 1, "side.jpg", "image/jpeg", b"jpeg")
            .unwrap();
        let deleted = store.delete_feature(0, 1).unwrap();

        assert_eq!(
            deleted.mutations,
            vec![
                RowMutation {
                    key: photo.key,
                    pending: None
                },
                RowMutation {
                    key: RowKey::feature(0, 1),
                    pending: Some(EditKind::Delete)
                },
            ]
        );
        assert!(store.attachments(0, 1).unwrap().is_empty());
        assert!(store.attachment_edit_batch().unwrap().is_empty());
    }

    #[test]
    fn test_pending_edits_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let mut store = create_store(&temp_dir);
            store.add_feature(0, &attrs("new"), None).unwrap();
            store.update_feature(1, 2, &attrs("done"), None).unwrap();
            let path = store.path().to_path_buf();
            store.close().unwrap();
            path
        };

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.pending_edits().unwrap(),
            vec![
                (RowKey::feature(0, -1), EditKind::Add),
                (RowKey::feature(1, 2), EditKind::Update),
            ]
        );
    }

    #[test]
    fn test_mark_applied_remaps_ids() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let feature = store.add_feature(0, &attrs("new"), None).unwrap();
        let photo = store
            .add_attachment(0, feature.key.id, "p.jpg", "image/jpeg", b"p")
            .unwrap();

        // Feature accepted as 500, attachment still pending
        store
            .mark_applied(
                &[feature.key],
                &[IdRemap {
                    table: TableKey::Features(0),
                    local_id: feature.key.id,
                    server_id: 500,
                }],
            )
            .unwrap();

        assert!(store.feature(0, 500).unwrap().is_some());
        assert!(store.feature(0, feature.key.id).unwrap().is_none());
        assert_eq!(
            store.pending_edits().unwrap(),
            vec![(photo.key, EditKind::Add)]
        );
        assert!(matches!(
            &store.attachment_edit_batch().unwrap()[..],
            [AttachmentEdit::Add { feature_id: 500, .. }]
        ));
    }

    #[test]
    fn test_apply_local_edit() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = create_store(&temp_dir);

        let applied = store
            .apply(&LocalEdit::DeleteAttachment { layer: 0, id: 1 })
            .unwrap();
        assert_eq!(applied.key, RowKey::attachment(0, 1));
        assert_eq!(
            store.attachment_edit_batch().unwrap(),
            vec![AttachmentEdit::Delete { layer: 0, id: 1 }]
        );
    }
}
