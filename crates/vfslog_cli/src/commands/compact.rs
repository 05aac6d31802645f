//! Compact command implementation.

use std::path::Path;
use vfslog_core::{safe_boundary, CompactionController, Config, LogPosition, RecordStore};

/// Runs the compact command.
///
/// Connects the store for writing so no other process appends while the log
/// is compacted.
pub fn run(path: &Path, up_to: Option<u64>, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default().version(None).create_if_missing(false);
    let store = RecordStore::connect(path, config.clone())?.store;
    let log = store.log().ok_or("Store has no operation log")?;

    println!("Compacting operation log at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let controller = CompactionController::with_config(log.clone(), &config);
    let ctx = controller.acquire_compaction_context()?;
    let begin = ctx.query().begin();
    let end = ctx.query().end();
    let target = up_to.map_or(end, LogPosition);

    println!("Compaction Analysis:");
    println!("  Log window:     [{}, {})", begin, end);
    println!("  Requested:      {}", target);

    if dry_run {
        let boundary = safe_boundary(target, begin, end, &[]);
        println!("  Boundary:       {}", boundary);
        println!("  Entries folded: {}", begin.distance_to(boundary));
        drop(ctx);
        store.disconnect()?;
        return Ok(());
    }

    let stats = controller.compact(&ctx, target)?;
    drop(ctx);

    println!("  Boundary:       {}", stats.boundary);
    println!("  Entries folded: {}", stats.entries_folded);
    if stats.degraded_files > 0 {
        println!("  Degraded files: {}", stats.degraded_files);
    }
    println!();
    match &stats.snapshot {
        Some(snapshot) => {
            println!("Wrote {snapshot}");
            println!(
                "Reclaimed {} entry chunks, {} payload chunks, {} snapshots",
                stats.reclaimed.entry_chunks, stats.reclaimed.payload_chunks, stats.reclaimed.snapshots
            );
            println!("✓ Compaction complete");
        }
        None => println!("No compaction needed - nothing before {} can be folded", stats.boundary),
    }

    store.disconnect()?;
    Ok(())
}
