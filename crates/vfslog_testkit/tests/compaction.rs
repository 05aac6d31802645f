//! Compaction integration tests.

use vfslog_core::{CompactionController, Config, FileId, LogPosition, RecordFlags};
use vfslog_testkit::prelude::*;

fn small_chunks() -> Config {
    Config::default().max_chunk_size(512)
}

#[test]
fn compaction_is_transparent_to_recovery() {
    let source = TestStore::with_config(small_chunks());
    scenarios::populated_tree(&source, 3, 2);
    let middle = source.log().end();
    source.delete_file(FileId(2)).unwrap();
    scenarios::populated_tree(&source, 2, 1);

    let plain = source.recover("plain");

    let controller = CompactionController::new(source.log());
    let stats = {
        let ctx = controller.acquire_compaction_context().unwrap();
        controller.compact(&ctx, middle).unwrap()
    };
    assert_eq!(stats.boundary, middle);
    assert_eq!(stats.degraded_files, 0);
    assert!(stats.reclaimed.entry_chunks > 0);
    assert_eq!(source.log().begin(), middle);

    let compacted = source.recover("compacted");
    assert_eq!(compacted.result.started_from, Some(middle));
    assert!(compacted.result.is_clean());
    assert_no_diff(&plain.store, &compacted.store);
    assert_no_diff(&source, &compacted.store);
}

#[test]
fn recovery_to_the_compaction_point_uses_only_the_snapshot() {
    let source = TestStore::new();
    scenarios::populated_tree(&source, 2, 2);
    let point = source.log().end();
    source.add_root("/tmp", RecordFlags::empty()).unwrap();

    let controller = CompactionController::new(source.log());
    let ctx = controller.acquire_compaction_context().unwrap();
    controller.force_compaction_up_to(&ctx, point).unwrap();
    drop(ctx);

    let recovered = source.recover_to("at-point", point).unwrap();
    assert_eq!(recovered.result.entries_applied, 0);
    assert_eq!(recovered.result.started_from, Some(point));
    assert_eq!(recovered.store.list_roots().unwrap(), vec![FileId(1)]);
}

#[test]
fn open_query_holds_the_boundary() {
    let source = TestStore::new();
    scenarios::populated_tree(&source, 2, 1);
    let first_point = source.log().end();

    let controller = CompactionController::new(source.log());
    {
        let ctx = controller.acquire_compaction_context().unwrap();
        controller.force_compaction_up_to(&ctx, first_point).unwrap();
    }

    scenarios::populated_tree(&source, 2, 1);
    let reader = source.log().query();
    assert_eq!(reader.begin(), first_point);
    scenarios::populated_tree(&source, 2, 1);
    let end = source.log().end();

    let ctx = controller.acquire_compaction_context().unwrap();
    let reached = controller.force_compaction_up_to(&ctx, end).unwrap();
    drop(ctx);
    assert_eq!(reached, reader.begin());
    assert_eq!(source.log().begin(), first_point);

    // The held window is still fully readable.
    let positions: Vec<LogPosition> = reader
        .entries()
        .map(|entry| entry.unwrap().position)
        .collect();
    assert_eq!(positions.first(), Some(&first_point));
    assert_eq!(positions.len() as u64, first_point.distance_to(reader.end()));

    drop(reader);
    let ctx = controller.acquire_compaction_context().unwrap();
    assert_eq!(controller.force_compaction_up_to(&ctx, end).unwrap(), end);
}

#[test]
fn target_below_begin_does_nothing() {
    let source = TestStore::new();
    scenarios::populated_tree(&source, 2, 1);
    let point = source.log().end();
    let controller = CompactionController::new(source.log());
    let ctx = controller.acquire_compaction_context().unwrap();
    controller.force_compaction_up_to(&ctx, point).unwrap();

    let stats = controller.compact(&ctx, LogPosition(2)).unwrap();
    assert_eq!(stats.boundary, point);
    assert!(stats.snapshot.is_none());
    assert_eq!(source.log().compaction_points().len(), 1);
}

#[test]
fn compaction_survives_reopening_the_store() {
    let source = TestStore::with_config(small_chunks());
    scenarios::populated_tree(&source, 3, 2);
    let point = source.log().end();
    {
        let controller = CompactionController::new(source.log());
        let ctx = controller.acquire_compaction_context().unwrap();
        controller.force_compaction_up_to(&ctx, point).unwrap();
    }
    scenarios::delete_scenario(&source);
    let path = source.path();
    source.disconnect().unwrap();

    let reopened = vfslog_core::RecordStore::connect(&path, Config::default())
        .unwrap()
        .store;
    let log = reopened.log().unwrap();
    assert_eq!(log.begin(), point);

    let recovered = recover_store(&reopened, &source.sibling("recovered"), log.end()).unwrap();
    assert!(recovered.result.is_clean());
    assert_no_diff(&reopened, &recovered.store);
}
