//! End-to-end table scenarios: row round-trips, tail rotation,
//! cross-segment replace, conversion, purge, and the concurrency
//! guarantees around them.

use std::sync::Arc;
use stratadb_core::{
    ColumnMeta, ColumnType, CoreError, IndexDef, Schema, Table, TableConfig,
};
use tempfile::tempdir;

fn row_schema() -> Schema {
    Schema::new(
        "row",
        vec![
            ColumnMeta::new("a", ColumnType::Int32),
            ColumnMeta::new("b", ColumnType::VarBinary),
        ],
    )
    .unwrap()
}

fn encode(a: i32, b: &[u8]) -> Vec<u8> {
    let mut row = Vec::with_capacity(4 + b.len());
    row.extend_from_slice(&a.to_le_bytes());
    row.extend_from_slice(b);
    row
}

fn create_table(dir: &std::path::Path, config: TableConfig) -> Arc<Table> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Table::create(dir, "t", row_schema(), &[IndexDef::new(["a"])], config).unwrap()
}

#[test]
fn basic_round_trip() {
    let dir = tempdir().unwrap();
    let table = create_table(dir.path(), TableConfig::default());
    let mut ctx = table.new_ctx();

    let rows = [encode(1, b"x"), encode(2, b"y"), encode(3, b"z")];
    for (i, row) in rows.iter().enumerate() {
        let id = table.insert_row(row, true, &mut ctx).unwrap();
        assert_eq!(id, i as u64);
    }
    assert_eq!(table.num_data_rows(), 3);

    let mut out = Vec::new();
    assert!(table.get_value(1, &mut out, &mut ctx).unwrap());
    assert_eq!(out, rows[1]);

    let mut ids = Vec::new();
    table
        .index_search_exact(0, &2i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids, vec![1]);

    assert!(matches!(
        table.get_value(3, &mut out, &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
}

#[test]
fn tail_rotation_keeps_lids_continuous() {
    let dir = tempdir().unwrap();
    // ~20-byte rows with per-row bookkeeping: the tail crosses 64 bytes
    // after two rows, so the third insert rotates
    let table = create_table(dir.path(), TableConfig::default().max_wr_seg_size(64));
    let mut ctx = table.new_ctx();

    for i in 0..3i32 {
        let id = table
            .insert_row(&encode(i, b"0123456789abcdef"), true, &mut ctx)
            .unwrap();
        assert_eq!(id, i as u64);
    }
    assert_eq!(table.num_segments(), 2);
    assert_eq!(table.num_data_rows(), 3);

    let stats = table.segment_stats();
    assert_eq!(stats[0].rows, 2);
    assert!(stats[0].frozen);
    assert_eq!(stats[1].rows, 1);
    assert!(!stats[1].frozen);

    // rows on both sides of the boundary stay readable
    let mut out = Vec::new();
    for i in 0..3i32 {
        assert!(table.get_value(i as u64, &mut out, &mut ctx).unwrap());
        assert_eq!(out, encode(i, b"0123456789abcdef"));
    }
}

#[test]
fn replace_across_segments_assigns_new_lid() {
    let dir = tempdir().unwrap();
    let table = create_table(dir.path(), TableConfig::default().max_wr_seg_size(64));
    let mut ctx = table.new_ctx();

    for i in 0..3i32 {
        table
            .insert_row(&encode(i, b"0123456789abcdef"), true, &mut ctx)
            .unwrap();
    }

    // LID 0 lives in the frozen first segment: replace goes through
    // delete-and-insert and returns a fresh id
    let new_id = table
        .replace_row(0, &encode(100, b"replacement-body"), true, &mut ctx)
        .unwrap();
    assert_eq!(new_id, 3);

    let mut out = Vec::new();
    assert!(!table.get_value(0, &mut out, &mut ctx).unwrap());
    assert!(table.get_value(3, &mut out, &mut ctx).unwrap());
    assert_eq!(out, encode(100, b"replacement-body"));
    assert_eq!(table.segment_stats()[0].deleted, 1);

    // a tail row replaces in place and keeps its id
    let same_id = table
        .replace_row(2, &encode(200, b"tail-rewrite-data"), true, &mut ctx)
        .unwrap();
    assert_eq!(same_id, 2);
    assert!(table.get_value(2, &mut out, &mut ctx).unwrap());
    assert_eq!(out, encode(200, b"tail-rewrite-data"));

    // the old index key is gone, the new one resolves
    let mut ids = Vec::new();
    table
        .index_search_exact(0, &0i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert!(ids.is_empty());
    table
        .index_search_exact(0, &200i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids, vec![2]);
}

/// Fills a table so the first segment freezes with exactly ten rows.
fn table_with_frozen_ten(dir: &std::path::Path) -> (Arc<Table>, Vec<Vec<u8>>) {
    let table = create_table(dir, TableConfig::default().max_wr_seg_size(350));
    let mut ctx = table.new_ctx();
    let mut rows = Vec::new();
    for i in 0..11i32 {
        let row = encode(i, b"0123456789abcdef");
        table.insert_row(&row, true, &mut ctx).unwrap();
        rows.push(row);
    }
    assert_eq!(table.num_segments(), 2);
    assert_eq!(table.segment_stats()[0].rows, 10);
    (table, rows)
}

#[test]
fn convert_preserves_live_rows() {
    let dir = tempdir().unwrap();
    let (table, rows) = table_with_frozen_ten(dir.path());
    let mut ctx = table.new_ctx();

    table.remove_row(2, true, &mut ctx).unwrap();
    table.remove_row(7, true, &mut ctx).unwrap();

    assert!(table.compact().unwrap());
    let stats = table.segment_stats();
    assert!(stats[0].read_only);
    assert!(stats[0].has_purge_bits);
    assert_eq!(stats[0].deleted, 2);
    assert_eq!(stats[0].rows, 10);

    let mut out = Vec::new();
    for id in 0..10u64 {
        let live = table.get_value(id, &mut out, &mut ctx).unwrap();
        if id == 2 || id == 7 {
            assert!(!live, "deleted row {id} must stay deleted");
        } else {
            assert!(live);
            assert_eq!(out, rows[id as usize]);
        }
    }

    // index queries return logical ids after the purge-bit translation
    let mut ids = Vec::new();
    table
        .index_search_exact(0, &8i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids, vec![8]);
    table
        .index_search_exact(0, &7i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert!(ids.is_empty());
}

#[test]
fn delete_racing_convert_lands_in_the_replacement() {
    let dir = tempdir().unwrap();
    let (table, _rows) = table_with_frozen_ten(dir.path());

    let compactor = {
        let table = table.clone();
        std::thread::spawn(move || table.compact().unwrap())
    };
    {
        let mut ctx = table.new_ctx();
        table.remove_row(5, true, &mut ctx).unwrap();
    }
    assert!(compactor.join().unwrap());

    // whether the delete hit before the snapshot or raced the pipeline,
    // the triple drain lands it in the swapped-in segment
    let mut ctx = table.new_ctx();
    let mut out = Vec::new();
    assert!(!table.get_value(5, &mut out, &mut ctx).unwrap());
    let stats = table.segment_stats();
    assert!(stats[0].read_only);
    assert_eq!(stats[0].deleted, 1);
    assert!(table.get_value(4, &mut out, &mut ctx).unwrap());
}

#[test]
fn purge_reclaims_space_and_renumbers() {
    let dir = tempdir().unwrap();
    let (table, rows) = table_with_frozen_ten(dir.path());
    let mut ctx = table.new_ctx();

    for id in [1u64, 4, 6, 9] {
        table.remove_row(id, true, &mut ctx).unwrap();
    }
    assert!(table.compact().unwrap());
    let before = table.segment_stats()[0];
    let size_before = table.data_storage_size();
    assert_eq!(before.deleted, 4);

    assert!(table.purge_deleted_rows(0).unwrap());
    let after = table.segment_stats()[0];
    assert_eq!(after.rows, 6);
    assert_eq!(after.deleted, 0);
    assert!(!after.has_purge_bits);
    assert!(table.data_storage_size() < size_before);
    assert_eq!(table.num_data_rows(), 7); // 6 kept + 1 tail row

    // live values survive as a set; ids were renumbered
    let mut seen = Vec::new();
    let mut iter = table.create_store_iter();
    let mut out = Vec::new();
    while let Some(_id) = iter.next_row(&mut out).unwrap() {
        seen.push(out.clone());
    }
    let mut expect: Vec<Vec<u8>> = (0..11)
        .filter(|i| ![1, 4, 6, 9].contains(i))
        .map(|i| rows[i as usize].clone())
        .collect();
    seen.sort();
    expect.sort();
    assert_eq!(seen, expect);

    // the index resolves the renumbered ids
    let mut ids = Vec::new();
    table
        .index_search_exact(0, &8i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert!(table.get_value(ids[0], &mut out, &mut ctx).unwrap());
    assert_eq!(out, rows[8]);
}

#[test]
fn scans_pin_deleted_ids_against_reuse() {
    let dir = tempdir().unwrap();
    let table = create_table(dir.path(), TableConfig::default());
    let mut ctx = table.new_ctx();

    for i in 0..4i32 {
        table.insert_row(&encode(i, b"row"), true, &mut ctx).unwrap();
    }
    table.remove_row(1, true, &mut ctx).unwrap();

    {
        let _iter = table.create_store_iter();
        // a live scan blocks reuse: the insert appends instead
        let id = table.insert_row(&encode(10, b"new"), true, &mut ctx).unwrap();
        assert_eq!(id, 4);
        // and compaction stands down entirely
        assert!(!table.compact().unwrap());
    }

    // with the scan gone the parked sub-id is reused
    let id = table.insert_row(&encode(11, b"new"), true, &mut ctx).unwrap();
    assert_eq!(id, 1);
    let mut out = Vec::new();
    assert!(table.get_value(1, &mut out, &mut ctx).unwrap());
    assert_eq!(out, encode(11, b"new"));
}

#[test]
fn index_mutations_are_tail_only() {
    let dir = tempdir().unwrap();
    let table = create_table(dir.path(), TableConfig::default().max_wr_seg_size(64));
    let mut ctx = table.new_ctx();

    for i in 0..3i32 {
        table
            .insert_row(&encode(i, b"0123456789abcdef"), false, &mut ctx)
            .unwrap();
    }
    // LID 2 is in the tail
    table
        .index_insert(0, &2i32.to_le_bytes(), 2, &mut ctx)
        .unwrap();
    let mut ids = Vec::new();
    table
        .index_search_exact(0, &2i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids, vec![2]);

    // LID 0 is frozen: every mutation is rejected
    assert!(matches!(
        table.index_insert(0, &0i32.to_le_bytes(), 0, &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
    assert!(matches!(
        table.index_remove(0, &0i32.to_le_bytes(), 0, &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
    assert!(matches!(
        table.index_replace(0, &0i32.to_le_bytes(), 0, 2, &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
    assert!(matches!(
        table.index_insert(9, &0i32.to_le_bytes(), 2, &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
}

#[test]
fn reopen_after_compact_restores_everything() {
    let dir = tempdir().unwrap();
    let rows;
    {
        let (table, r) = table_with_frozen_ten(dir.path());
        rows = r;
        let mut ctx = table.new_ctx();
        table.remove_row(3, true, &mut ctx).unwrap();
        assert!(table.compact().unwrap());
    }

    let table = Table::open(dir.path(), "t").unwrap();
    let mut ctx = table.new_ctx();
    assert_eq!(table.num_data_rows(), 11);
    let stats = table.segment_stats();
    assert!(stats[0].read_only);
    assert_eq!(stats[0].deleted, 1);

    let mut out = Vec::new();
    for id in 0..11u64 {
        let live = table.get_value(id, &mut out, &mut ctx).unwrap();
        assert_eq!(live, id != 3);
        if live {
            assert_eq!(out, rows[id as usize]);
        }
    }
    let mut ids = Vec::new();
    table
        .index_search_exact(0, &6i32.to_le_bytes(), &mut ids, &mut ctx)
        .unwrap();
    assert_eq!(ids, vec![6]);

    // the reopened tail keeps accepting inserts with continuous ids
    let id = table.insert_row(&encode(50, b"after"), true, &mut ctx).unwrap();
    assert_eq!(id, 11);
}

#[test]
fn in_place_updates_survive_conversion() {
    let dir = tempdir().unwrap();
    let schema = Schema::new(
        "row",
        vec![
            ColumnMeta::new("a", ColumnType::Int32),
            ColumnMeta::new("b", ColumnType::VarBinary),
            ColumnMeta::new("hits", ColumnType::Uint64).updatable(),
        ],
    )
    .unwrap();
    let table = Table::create(
        dir.path(),
        "t",
        schema,
        &[IndexDef::new(["a"])],
        TableConfig::default().max_wr_seg_size(512),
    )
    .unwrap();
    let mut ctx = table.new_ctx();

    let encode3 = |a: i32, b: &[u8], hits: u64| {
        let mut row = Vec::new();
        row.extend_from_slice(&a.to_le_bytes());
        row.extend_from_slice(&(b.len() as u32).to_le_bytes());
        row.extend_from_slice(b);
        row.extend_from_slice(&hits.to_le_bytes());
        row
    };

    for i in 0..12i32 {
        table
            .insert_row(&encode3(i, b"0123456789abcdef", 0), true, &mut ctx)
            .unwrap();
    }
    // freeze the first segment by forcing a rotation
    while table.num_segments() == 1 {
        table
            .insert_row(&encode3(99, b"0123456789abcdef", 0), true, &mut ctx)
            .unwrap();
    }

    // update a frozen row's counter cell in place
    table
        .update_inplace_column(4, 2, &7u64.to_le_bytes(), &mut ctx)
        .unwrap();
    let mut out = Vec::new();
    assert!(table.select_one_column(4, 2, &mut out, &mut ctx).unwrap());
    assert_eq!(out, 7u64.to_le_bytes());

    assert!(table.compact().unwrap());
    assert!(table.segment_stats()[0].read_only);

    // the cell survives conversion, and stays updatable after it
    assert!(table.get_value(4, &mut out, &mut ctx).unwrap());
    assert_eq!(out, encode3(4, b"0123456789abcdef", 7));
    table
        .update_inplace_column(4, 2, &8u64.to_le_bytes(), &mut ctx)
        .unwrap();
    assert!(table.select_one_column(4, 2, &mut out, &mut ctx).unwrap());
    assert_eq!(out, 8u64.to_le_bytes());

    // non-updatable columns reject the in-place path
    assert!(matches!(
        table.update_inplace_column(4, 0, &1i32.to_le_bytes(), &mut ctx),
        Err(CoreError::InvalidArgument { .. })
    ));
}

#[test]
fn select_columns_projects_without_full_rows() {
    let dir = tempdir().unwrap();
    let table = create_table(dir.path(), TableConfig::default().max_wr_seg_size(64));
    let mut ctx = table.new_ctx();

    for i in 0..3i32 {
        table
            .insert_row(&encode(i, b"0123456789abcdef"), true, &mut ctx)
            .unwrap();
    }
    assert!(table.compact().unwrap());

    let mut out = Vec::new();
    // frozen-then-converted segment
    assert!(table.select_one_column(1, 0, &mut out, &mut ctx).unwrap());
    assert_eq!(out, 1i32.to_le_bytes());
    assert!(table.select_columns(1, &[1], &mut out, &mut ctx).unwrap());
    assert_eq!(out, b"0123456789abcdef");
    // tail segment
    assert!(table.select_columns(2, &[0, 1], &mut out, &mut ctx).unwrap());
    assert_eq!(out, encode(2, b"0123456789abcdef"));
}

#[test]
fn create_twice_is_already_initialized() {
    let dir = tempdir().unwrap();
    {
        let _table = create_table(dir.path(), TableConfig::default());
    }
    let err = Table::create(
        dir.path(),
        "t",
        row_schema(),
        &[IndexDef::new(["a"])],
        TableConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyInitialized { .. }));
}

#[test]
fn second_opener_is_locked_out() {
    let dir = tempdir().unwrap();
    let _table = create_table(dir.path(), TableConfig::default());
    assert!(matches!(
        Table::open(dir.path(), "t"),
        Err(CoreError::TableLocked)
    ));
}

#[test]
fn unknown_index_column_is_rejected() {
    let dir = tempdir().unwrap();
    let err = Table::create(
        dir.path(),
        "t",
        row_schema(),
        &[IndexDef::new(["missing"])],
        TableConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::InvalidArgument { .. }));
}

#[test]
fn converted_segment_directories_swap_on_disk() {
    let dir = tempdir().unwrap();
    let (table, _rows) = table_with_frozen_ten(dir.path());
    assert!(dir.path().join("t/wr-0000").exists());

    assert!(table.compact().unwrap());
    assert!(dir.path().join("t/rd-0000").exists());
    assert!(!dir.path().join("t/rd-0000.tmp").exists());
    // the input directory is gone once its last owner dropped
    assert!(!dir.path().join("t/wr-0000").exists());
    assert!(dir.path().join("t/wr-0001").exists());
}

#[test]
fn interrupted_isdel_rewrite_restores_backup() {
    let dir = tempdir().unwrap();
    {
        let (table, _rows) = table_with_frozen_ten(dir.path());
        let mut ctx = table.new_ctx();
        table.remove_row(2, true, &mut ctx).unwrap();
        assert!(table.compact().unwrap());
    }

    // simulate a crash mid-rewrite: the backup holds the good bitmap, the
    // formal IsDel claims a truncated row count
    let seg_dir = dir.path().join("t/rd-0000");
    let isdel = seg_dir.join("IsDel");
    std::fs::copy(&isdel, seg_dir.join("IsDel.backup")).unwrap();
    let mut data = std::fs::read(&isdel).unwrap();
    data[..8].copy_from_slice(&5u64.to_le_bytes());
    std::fs::write(&isdel, &data).unwrap();

    let table = Table::open(dir.path(), "t").unwrap();
    let stats = table.segment_stats();
    assert_eq!(stats[0].rows, 10);
    assert_eq!(stats[0].deleted, 1);

    let mut ctx = table.new_ctx();
    let mut out = Vec::new();
    assert!(!table.get_value(2, &mut out, &mut ctx).unwrap());
    assert!(table.get_value(9, &mut out, &mut ctx).unwrap());
}

#[test]
fn scan_sees_rows_across_all_segments() {
    let dir = tempdir().unwrap();
    let (table, rows) = table_with_frozen_ten(dir.path());
    let mut ctx = table.new_ctx();
    table.remove_row(0, true, &mut ctx).unwrap();
    assert!(table.compact().unwrap());

    let mut iter = table.create_store_iter();
    let mut out = Vec::new();
    let mut seen = Vec::new();
    while let Some(id) = iter.next_row(&mut out).unwrap() {
        seen.push((id, out.clone()));
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], (1, rows[1].clone()));
    assert_eq!(seen.last().unwrap(), &(10, rows[10].clone()));
}
