//! Recover command implementation.

use std::path::Path;
use tracing::info;
use vfslog_core::{
    oplog_dir, recover_from_point, Config, LogPosition, NoReadLock, OperationLog, RecoveryState,
};

/// Runs the recover command.
///
/// Only the source's operation log is read, so a store that no longer
/// connects can still be rebuilt.
pub fn run(
    source: &Path,
    target: &Path,
    to: Option<u64>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Recovering {:?} into {:?}", source, target);

    let dir = oplog_dir(source);
    if !dir.exists() {
        return Err("Operation log not found".into());
    }

    let log = OperationLog::open(&dir, true)?;
    let query = log.query();
    let end_point = to.map_or(query.end(), LogPosition);

    let recovery = recover_from_point(
        end_point,
        &query,
        Some(source),
        target,
        &NoReadLock,
        &Config::default(),
    )?;
    recovery.store.disconnect()?;
    let result = recovery.result;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Recovered {:?} into {:?}", source, target);
            println!();
            println!("  Up to:              {}", result.recovered_up_to);
            match result.started_from {
                Some(position) => println!("  Started from:       snapshot at {}", position),
                None => println!("  Started from:       empty store"),
            }
            println!("  Entries applied:    {}", result.entries_applied);
            println!("  OK:                 {}", result.count(RecoveryState::Ok));
            println!("  PARTIAL:            {}", result.count(RecoveryState::Partial));
            println!("  BOTCHED:            {}", result.count(RecoveryState::Botched));
            println!("  Botched attributes: {}", result.botched_attributes_count);
            println!();
            if result.is_clean() {
                println!("✓ Recovery complete");
            } else {
                println!("Recovery complete with degraded files");
            }
        }
    }

    Ok(())
}
