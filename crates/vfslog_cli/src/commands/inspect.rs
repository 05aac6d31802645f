//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use vfslog_core::{Config, FileId, LogStats, RecordStore};

/// Store statistics.
#[derive(Debug, Serialize)]
pub struct StoreInfo {
    /// Store version from the manifest.
    pub store_version: u32,
    /// Whether the last session ended without disconnecting.
    pub needs_recovery: bool,
    /// Highest allocated file id.
    pub max_allocated_id: u32,
    /// Live records.
    pub live_records: usize,
    /// Tombstoned records.
    pub tombstones: usize,
    /// Root ids.
    pub roots: Vec<FileId>,
    /// Operation log statistics, if the store has a log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogStats>,
    /// Live records, when requested.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RecordInfo>,
}

/// One live record.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// File id.
    pub id: FileId,
    /// Parent id, None for roots.
    pub parent: Option<FileId>,
    /// Name.
    pub name: Option<String>,
    /// Flags, as text; empty when none are set.
    pub flags: String,
    /// Content size in bytes.
    pub content_len: Option<usize>,
    /// Number of children.
    pub children: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, records: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = RecordStore::connect(path, Config::inspection())?.store;
    let info = collect(&store, records)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&info)?),
        _ => print_text_output(path, &info),
    }
    Ok(())
}

fn collect(store: &RecordStore, with_records: bool) -> Result<StoreInfo, Box<dyn std::error::Error>> {
    let max_id = store.max_allocated_id()?;
    let live_records = store.live_count()?;
    let mut records = Vec::new();
    if with_records {
        for raw in 1..=max_id.0 {
            let id = FileId(raw);
            if store.is_deleted(id)? {
                continue;
            }
            records.push(RecordInfo {
                id,
                parent: store.get_parent(id)?,
                name: store.get_name(id)?,
                flags: store
                    .get_flags(id)?
                    .filter(|flags| !flags.is_empty())
                    .map(|flags| flags.to_string())
                    .unwrap_or_default(),
                content_len: store.read_content(id)?.map(|c| c.len()),
                children: store.list_ids(id)?.len(),
            });
        }
    }

    Ok(StoreInfo {
        store_version: store.store_version(),
        needs_recovery: store.needs_recovery(),
        max_allocated_id: max_id.0,
        live_records,
        tombstones: max_id.0 as usize - live_records,
        roots: store.list_roots()?,
        log: store.log().map(|log| log.stats()),
        records,
    })
}

fn print_text_output(path: &Path, info: &StoreInfo) {
    println!("Store at {:?}", path);
    println!("================");
    println!("  Version:          {}", info.store_version);
    println!(
        "  Shutdown:         {}",
        if info.needs_recovery { "unclean" } else { "clean" }
    );
    println!("  Max allocated id: {}", info.max_allocated_id);
    println!("  Live records:     {}", info.live_records);
    println!("  Tombstones:       {}", info.tombstones);
    println!("  Roots:            {}", info.roots.len());

    if let Some(log) = &info.log {
        println!();
        println!("Operation log");
        println!("================");
        println!("  Window:            [{}, {})", log.begin, log.end);
        println!("  First retained:    {}", log.first_retained);
        println!("  Entry chunks:      {}", log.entry_chunks);
        println!("  Payload chunks:    {}", log.payload_chunks);
        println!("  Compaction points: {}", log.compaction_points.len());
        for point in &log.compaction_points {
            println!("    {point}");
        }
    }

    if !info.records.is_empty() {
        println!();
        println!("Records");
        println!("================");
        for record in &info.records {
            print!("[{:>8}] {:24}", record.id.0, record.name.as_deref().unwrap_or("-"));
            if let Some(parent) = record.parent {
                print!(" parent={}", parent.0);
            }
            if !record.flags.is_empty() {
                print!(" flags={}", record.flags);
            }
            if let Some(len) = record.content_len {
                print!(" content={} bytes", len);
            }
            if record.children > 0 {
                print!(" children={}", record.children);
            }
            println!();
        }
    }
}
