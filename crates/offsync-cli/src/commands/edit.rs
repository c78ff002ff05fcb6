//! Edit command handlers
//!
//! Writes go to the local replica and are counted as pending edits until
//! the next sync.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use offsync_core::{Config, LocalEdit};

use crate::commands::open_controller;
use crate::output::Output;

/// Apply one edit to the local replica
pub fn apply(config: &Config, edit: LocalEdit, output: &Output) -> Result<()> {
    let mut controller = open_controller(config)?;
    let key = controller.apply_edit(&edit)?;

    match output.format {
        crate::output::OutputFormat::Quiet => println!("{}", key.id),
        crate::output::OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "status": "success",
                    "row": key,
                    "pending_edits": controller.pending_edit_count()
                })
            );
        }
        crate::output::OutputFormat::Human => {
            println!("✓ Saved {}", key);
            println!("  {} unsynced edit(s)", controller.pending_edit_count());
        }
    }
    Ok(())
}

/// Parse a JSON object of attribute values
pub fn parse_attributes(json: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(json).context("Attributes must be valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("Attributes must be a JSON object, e.g. '{{\"name\": \"Well 4\"}}'"),
    }
}

/// Parse an optional geometry given as JSON
pub fn parse_geometry(json: Option<&str>) -> Result<Option<Value>> {
    json.map(|g| serde_json::from_str(g).context("Geometry must be valid JSON"))
        .transpose()
}

/// Build an attachment edit from a file on disk
pub fn attachment_from_file(
    layer: u32,
    feature_id: i64,
    file: &Path,
    content_type: Option<String>,
) -> Result<LocalEdit> {
    let data = std::fs::read(file)
        .with_context(|| format!("Failed to read attachment: {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let content_type = content_type.unwrap_or_else(|| guess_content_type(file).to_string());

    Ok(LocalEdit::AddAttachment {
        layer,
        feature_id,
        name,
        content_type,
        data,
    })
}

fn guess_content_type(file: &Path) -> &'static str {
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
