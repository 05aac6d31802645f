//! Diff command implementation.

use std::path::Path;
use vfslog_core::{Config, DiffOracle, LogMode, RecordStore};

/// Runs the diff command.
///
/// Both stores are opened read-only without a version check. Differences
/// make the command fail after printing them.
pub fn run(
    base: &Path,
    target: &Path,
    max_elements: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::inspection().log_mode(LogMode::Disabled);
    let oracle = match max_elements {
        Some(max) => DiffOracle::new(max),
        None => DiffOracle::from_config(&config),
    };

    let base_store = RecordStore::connect(base, config.clone())?.store;
    let target_store = RecordStore::connect(target, config)?.store;
    let result = oracle.diff(&base_store, &target_store)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Comparing {:?} against {:?}", target, base);
            println!();
            println!("{result}");
        }
    }

    if result.is_empty() {
        Ok(())
    } else {
        Err(format!("stores differ ({} differences)", result.elements.len()).into())
    }
}
