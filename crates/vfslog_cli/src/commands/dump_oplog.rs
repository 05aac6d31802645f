//! Dump oplog command implementation.

use std::path::Path;
use vfslog_core::{oplog_dir, LogEntry, LogPosition, OperationLog};

/// Runs the dump-oplog command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    from: Option<u64>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = oplog_dir(path);
    if !dir.exists() {
        return Err("Operation log not found".into());
    }

    let log = OperationLog::open(&dir, true)?;
    let query = log.query();
    let start = from.map_or(query.begin(), LogPosition);
    let max_entries = limit.unwrap_or(usize::MAX);

    let entries = query
        .iterate(start, query.end())?
        .take(max_entries)
        .collect::<Result<Vec<LogEntry>, _>>()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries, query.begin(), query.end());
        }
    }

    Ok(())
}

fn print_text_output(entries: &[LogEntry], begin: LogPosition, end: LogPosition) {
    println!(
        "Operation log entries ({} shown, window [{}, {}))",
        entries.len(),
        begin,
        end
    );
    println!("================");
    println!();

    for entry in entries {
        println!("{entry}");
    }
}
