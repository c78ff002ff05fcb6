//! Status command handler

use anyhow::Result;

use offsync_core::Config;

use crate::commands::open_controller;
use crate::output::{Output, OutputFormat};

/// Show mode, local store and pending edits
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let controller = open_controller(config)?;
    let store = controller.local_store().map(|store| store.info().clone());
    let tables = controller.ledger().all_counts();

    match output.format {
        OutputFormat::Json => {
            let tables: Vec<_> = tables
                .iter()
                .map(|(table, counts)| {
                    serde_json::json!({
                        "table": table,
                        "added": counts.added,
                        "updated": counts.updated,
                        "deleted": counts.deleted
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "mode": controller.mode(),
                    "service_url": config.service_url,
                    "store": store,
                    "pending_edits": controller.pending_edit_count(),
                    "tables": tables
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", controller.mode());
        }
        OutputFormat::Human => {
            println!("offsync Status");
            println!("==============");
            println!();
            println!("Mode: {}", controller.mode());
            if let Some(ref url) = config.service_url {
                println!("Service: {}", url);
            }
            println!();
            println!("Local store:");
            match store {
                Some(info) => {
                    println!("  Location: {}", info.path.display());
                    println!("  Extent:   {}", info.source_extent);
                    println!("  Created:  {}", info.created_at.format("%Y-%m-%d %H:%M"));
                }
                None => println!("  (none)"),
            }
            println!();
            println!("Pending edits: {}", controller.pending_edit_count());
            for (table, counts) in &tables {
                println!(
                    "  {}: {} added, {} updated, {} deleted",
                    table, counts.added, counts.updated, counts.deleted
                );
            }
        }
    }

    Ok(())
}
