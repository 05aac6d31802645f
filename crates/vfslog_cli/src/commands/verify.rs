//! Verify command implementation.

use std::path::Path;
use vfslog_core::{
    oplog_dir, Config, CoreError, CoreResult, FileId, LogMode, OperationLog, RecordStore,
    ResolvedOperation,
};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of items checked.
    pub checked: u64,
    /// Number of items that passed.
    pub valid: u64,
    /// Problems that do not fail verification.
    pub warnings: Vec<String>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_store: bool, check_log: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let mut store_result = VerifyResult::default();
    let mut log_result = VerifyResult::default();

    if check_store {
        println!("Checking records...");
        store_result = verify_store(path);
        print_result("Records", &store_result);
    }

    if check_log {
        let dir = oplog_dir(path);
        if dir.exists() {
            println!("Checking operation log...");
            log_result = verify_log(&dir);
            print_result("Operation log", &log_result);
        } else {
            println!("Operation log not found (the store may run without one)");
        }
    }

    println!();
    if store_result.is_ok() && log_result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

fn verify_store(path: &Path) -> VerifyResult {
    let mut result = VerifyResult::default();
    let config = Config::inspection().log_mode(LogMode::Disabled);
    let store = match RecordStore::connect(path, config) {
        Ok(connected) => connected.store,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };
    if store.needs_recovery() {
        result
            .warnings
            .push("previous session did not disconnect; records may be stale".to_string());
    }
    if let Err(e) = check_tree(&store, &mut result) {
        result.errors.push(e.to_string());
    }
    result
}

fn check_tree(store: &RecordStore, result: &mut VerifyResult) -> CoreResult<()> {
    let max_id = store.max_allocated_id()?;
    let roots = store.list_roots()?;
    let mut orphans = 0;
    for raw in 1..=max_id.0 {
        let id = FileId(raw);
        result.checked += 1;
        if store.is_deleted(id)? {
            result.valid += 1;
            continue;
        }
        let mut ok = true;
        for child in store.list_ids(id)? {
            if store.get_parent(child)? != Some(id) {
                result
                    .errors
                    .push(format!("{child} is listed under {id} but has another parent"));
                ok = false;
            }
        }
        match store.get_parent(id)? {
            Some(parent) if !store.list_ids(parent)?.contains(&id) => {
                result
                    .errors
                    .push(format!("{id} points at {parent}, which does not list it"));
                ok = false;
            }
            None if !roots.contains(&id) => orphans += 1,
            _ => {}
        }
        if ok {
            result.valid += 1;
        }
    }
    if orphans > 0 {
        result
            .warnings
            .push(format!("{orphans} live records are neither roots nor children"));
    }
    Ok(())
}

fn verify_log(dir: &Path) -> VerifyResult {
    let mut result = VerifyResult::default();
    let log = match OperationLog::open(dir, true) {
        Ok(log) => log,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };
    let query = log.query();

    let base = query.get_base_snapshot(
        |reference| {
            Err(CoreError::snapshot_unavailable(
                reference.position,
                format!("{} is missing", reference.file_name),
            ))
        },
        |reference, e| {
            Err(CoreError::snapshot_unavailable(
                reference.position,
                e.to_string(),
            ))
        },
    );
    if let Err(e) = base {
        result.errors.push(e.to_string());
    }

    for entry in query.entries() {
        result.checked += 1;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                result.errors.push(e.to_string());
                break;
            }
        };
        match query.resolve(&entry) {
            Ok(ResolvedOperation::Ready(_)) => result.valid += 1,
            Ok(ResolvedOperation::PayloadUnavailable(_)) => {
                result
                    .warnings
                    .push(format!("payload of entry {} is unavailable", entry.position));
            }
            Err(e) => result.errors.push(format!("entry {}: {e}", entry.position)),
        }
    }
    result
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {}: {} checked, {} valid", name, result.checked, result.valid);
    for warning in &result.warnings {
        println!("    warning: {}", warning);
    }
    for error in &result.errors {
        println!("    error: {}", error);
    }
}
