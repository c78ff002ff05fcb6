//! SQLite schema of the local replica
//!
//! `pending_edits` is the durable change tracking: the in-memory ledger is
//! only a cache of it and is rebuilt from it on relaunch.

use rusqlite::{Connection, OptionalExtension, Result};

/// Current schema version of replica files
pub const SCHEMA_VERSION: i32 = 1;

/// Metadata key written last when a replica is created
const COMPLETE_KEY: &str = "complete";

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Replica metadata (version, source, completeness)
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Layers taken offline
        CREATE TABLE IF NOT EXISTS layers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            has_geometry INTEGER NOT NULL,
            supports_attachments INTEGER NOT NULL
        );

        -- Feature rows; locally added rows have negative ids
        CREATE TABLE IF NOT EXISTS features (
            layer INTEGER NOT NULL,
            id INTEGER NOT NULL,
            attributes TEXT NOT NULL,
            geometry TEXT,
            PRIMARY KEY (layer, id),
            FOREIGN KEY (layer) REFERENCES layers(id)
        );

        -- Attachment rows, owned by a feature of the same layer
        CREATE TABLE IF NOT EXISTS attachments (
            layer INTEGER NOT NULL,
            id INTEGER NOT NULL,
            feature_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            content_type TEXT NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (layer, id)
        );

        -- Durable change tracking
        CREATE TABLE IF NOT EXISTS pending_edits (
            table_kind TEXT NOT NULL CHECK (table_kind IN ('features', 'attachments')),
            layer INTEGER NOT NULL,
            row_id INTEGER NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('add', 'update', 'delete')),
            PRIMARY KEY (table_kind, layer, row_id)
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_feature ON attachments(layer, feature_id);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the schema version recorded in the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    if !has_metadata(conn)? {
        return Ok(None);
    }
    let version: Option<String> = conn
        .query_row("SELECT value FROM metadata WHERE key = 'version'", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.and_then(|v| v.parse().ok()))
}

/// Record that every table has been fully written
pub fn mark_complete(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, '1')",
        [COMPLETE_KEY],
    )?;
    Ok(())
}

/// Whether the completeness marker is present
pub fn is_complete(conn: &Connection) -> Result<bool> {
    if !has_metadata(conn)? {
        return Ok(false);
    }
    conn.prepare("SELECT 1 FROM metadata WHERE key = ? AND value = '1'")?
        .exists([COMPLETE_KEY])
}

fn has_metadata(conn: &Connection) -> Result<bool> {
    conn.prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='metadata'")?
        .exists([])
}
