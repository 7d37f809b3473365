//! Convert and purge: the segment-migration pipelines.
//!
//! **Convert** turns one frozen writable segment into a compressed
//! read-only segment. **Purge** rebuilds a read-only segment without its
//! deleted rows, compacting the table's id space. Neither blocks readers of
//! other segments or writers of the tail; both end with a short writer-lock
//! swap.
//!
//! Updates racing a pipeline are not lost: journaling is enabled on the
//! input before its deletion bits are snapshotted, and the journal is
//! drained three times: lock-free, under the reader lock, and finally
//! under the writer lock that performs the swap. Any update committed
//! before that swap is therefore reflected in the replacement segment.

use crate::bitmap::{BitVec, RankSelect0};
use crate::context::TableCtx;
use crate::error::{CoreError, CoreResult};
use crate::index::{build_index, EmptyIndexStore, IndexHandles};
use crate::schema::TableSchema;
use crate::segment::readonly::Colgroup;
use crate::segment::{ReadonlySegment, Segment, WritableSegment};
use crate::store::{
    build_store, DictZipStore, EmptyStore, FixedLenStore, MultiPartStore, PlainBlobStore,
    ReadableStore, SortableStrVec,
};
use crate::table::Table;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratadb_storage::{atomic_rename, tmp_sibling};

/// Per-colgroup temporary files of a convert's first pass.
///
/// Fixed-width colgroups stream into a fixed-length store that can be
/// adopted as the final store; everything else streams into a plain blob
/// file that is consumed by the later build passes and then deleted.
struct TempColgroups {
    entries: Vec<Option<TempEntry>>,
}

struct TempEntry {
    store: TempStore,
    path: PathBuf,
}

enum TempStore {
    Fixed(FixedLenStore),
    Blob(PlainBlobStore),
}

impl TempStore {
    fn append(&mut self, record: &[u8]) -> CoreResult<()> {
        match self {
            TempStore::Fixed(store) => store.append(record).map(|_| ()),
            TempStore::Blob(store) => store.append(record).map(|_| ()),
        }
    }

    fn as_store(&self) -> &dyn ReadableStore {
        match self {
            TempStore::Fixed(store) => store,
            TempStore::Blob(store) => store,
        }
    }
}

impl TempColgroups {
    fn create(tmp_dir: &Path, schema: &TableSchema) -> CoreResult<Self> {
        let mut entries = Vec::with_capacity(schema.colgroup_num());
        for cg in 0..schema.colgroup_num() {
            let cg_schema = &schema.colgroups[cg];
            let entry = match cg_schema.fixed_row_len() {
                Some(fixed_len) => {
                    // adoption candidates get their final file name
                    let path = if cg >= schema.index_num() {
                        tmp_dir.join(format!("colgroup-{}.fixlen", cg_schema.name()))
                    } else {
                        tmp_dir.join(format!("tmp-colgroup-{}.fixlen", cg_schema.name()))
                    };
                    TempEntry {
                        store: TempStore::Fixed(FixedLenStore::create(&path, fixed_len)?),
                        path,
                    }
                }
                None => {
                    let path = tmp_dir.join(format!("tmp-colgroup-{}.blob", cg_schema.name()));
                    TempEntry {
                        store: TempStore::Blob(PlainBlobStore::create(&path)?),
                        path,
                    }
                }
            };
            entries.push(Some(entry));
        }
        Ok(Self { entries })
    }

    /// Appends every colgroup projection of one parsed row.
    fn write_row(
        &mut self,
        schema: &TableSchema,
        cols: &crate::schema::ColumnVec,
        src: &[u8],
        scratch: &mut Vec<u8>,
    ) -> CoreResult<()> {
        for (cg, entry) in self.entries.iter_mut().enumerate() {
            scratch.clear();
            schema.colgroups[cg].select_parent_append(cols, src, scratch);
            entry
                .as_mut()
                .expect("temp store present during the first pass")
                .store
                .append(scratch)?;
        }
        Ok(())
    }

    fn complete(&mut self) -> CoreResult<()> {
        for entry in self.entries.iter_mut().flatten() {
            match &mut entry.store {
                TempStore::Fixed(store) => store.flush()?,
                TempStore::Blob(store) => store.finish()?,
            }
        }
        Ok(())
    }

    fn take(&mut self, cg: usize) -> TempEntry {
        self.entries[cg].take().expect("temp store taken once")
    }
}

impl Drop for TempColgroups {
    fn drop(&mut self) {
        // leftover temp files of an aborted pipeline
        for entry in self.entries.iter().flatten() {
            let _ = std::fs::remove_file(&entry.path);
        }
    }
}

fn remove_temp(entry: TempEntry) {
    let TempEntry { store, path } = entry;
    drop(store);
    if let Err(err) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), %err, "failed to remove temp colgroup file");
    }
}

/// Collects all records of `store` into one key batch.
fn collect_all(store: &dyn ReadableStore, out: &mut SortableStrVec) -> CoreResult<()> {
    let mut rec = Vec::new();
    for id in 0..store.num_rows() {
        rec.clear();
        store.get_value_append(id, &mut rec)?;
        out.push(&rec);
    }
    Ok(())
}

/// Builds the compressed store(s) for one variable-width colgroup by
/// walking `source` and chunking on the compression memory budget.
fn build_chunked(
    table: &Table,
    cg: usize,
    source: &dyn ReadableStore,
) -> CoreResult<Arc<dyn ReadableStore>> {
    let schema = &table.schema.colgroups[cg];
    let budget = table.config.compressing_work_mem_size;
    let mut parts: Vec<Arc<dyn ReadableStore>> = Vec::new();
    let mut chunk = SortableStrVec::new();
    let mut rec = Vec::new();
    for id in 0..source.num_rows() {
        if chunk.mem_size() >= budget && !chunk.is_empty() {
            parts.push(build_store(schema, &chunk)?);
            chunk.clear();
        }
        rec.clear();
        source.get_value_append(id, &mut rec)?;
        chunk.push(&rec);
    }
    if !chunk.is_empty() || parts.is_empty() {
        parts.push(build_store(schema, &chunk)?);
    }
    Ok(if parts.len() == 1 {
        parts.pop().expect("one part")
    } else {
        Arc::new(MultiPartStore::new(parts))
    })
}

fn dict_zip_wanted(table: &Table, cg: usize, inflate: u64, rows: u64) -> bool {
    if !table.config.enable_dict_zip || rows == 0 {
        return false;
    }
    let requested = {
        let schema = &table.schema.colgroups[cg];
        (0..schema.column_num()).any(|i| schema.column(i).dict_zip)
    };
    requested || inflate / rows > table.config.dict_zip_min_avg_len
}

/// Converts the frozen writable segment at `seg_idx` into a read-only
/// segment and swaps it into the table.
pub(crate) fn convert_segment(table: &Table, seg_idx: usize) -> CoreResult<()> {
    let schema = table.schema.clone();
    let input: Arc<dyn Segment> = table.state.read().segments[seg_idx].clone();
    let input_wr = input.as_writable().ok_or_else(|| {
        CoreError::logic(format!("convert input {seg_idx} is not writable"))
    })?;
    if !input.core().is_frozen() {
        return Err(CoreError::logic(format!(
            "convert input {seg_idx} is not frozen"
        )));
    }
    tracing::info!(dir = %input.core().dir().display(), "converting segment");

    // journal first, snapshot second: every mutation after this point is
    // either in the snapshot or in the journal
    input.core().enable_book_updates();
    let mut new_is_del = input.core().snapshot_bits();
    let logic_rows = new_is_del.len();

    let formal_dir = table.seg_dir("rd", seg_idx);
    let tmp_dir = tmp_sibling(&formal_dir);
    std::fs::create_dir_all(&tmp_dir)?;

    // first pass: project every live row into the temp colgroup files
    let mut temp = TempColgroups::create(&tmp_dir, &schema)?;
    let mut ctx = TableCtx::new();
    let mut row = Vec::new();
    let mut new_row_num = 0u64;
    for id in 0..logic_rows as u64 {
        if new_is_del.get(id as usize) {
            continue;
        }
        if !input_wr.row_present(id) {
            tracing::warn!(dir = %input.core().dir().display(), id, "row lost before conversion");
            input.core().set_del(id)?;
            new_is_del.set1(id as usize);
            continue;
        }
        row.clear();
        input_wr.get_value_append(id, &mut row, &mut ctx)?;
        schema.row.parse_row(&row, &mut ctx.cols1)?;
        temp.write_row(&schema, &ctx.cols1, &row, &mut ctx.buf1)?;
        new_row_num += 1;
    }
    temp.complete()?;
    let del_cnt = new_is_del.popcnt();

    // second pass: indexes from the temp key files
    let mut indexes = Vec::with_capacity(schema.index_num());
    for i in 0..schema.index_num() {
        let entry = temp.take(i);
        let mut keys = SortableStrVec::new();
        collect_all(entry.store.as_store(), &mut keys)?;
        remove_temp(entry);
        indexes.push(build_index(
            &schema.indexes[i].schema,
            schema.indexes[i].unique,
            &keys,
        )?);
    }

    // third pass: the remaining colgroup stores
    let mut colgroups: Vec<Colgroup> = Vec::with_capacity(schema.colgroup_num());
    for handles in &indexes {
        colgroups.push(Colgroup::Plain(handles.store.clone()));
    }
    for cg in schema.index_num()..schema.colgroup_num() {
        let entry = temp.take(cg);
        let updatable = schema.updatable_colgroups.contains(&cg);
        if updatable {
            let TempEntry { store, .. } = entry;
            let TempStore::Fixed(store) = store else {
                return Err(CoreError::logic("updatable colgroup temp is not fixed"));
            };
            colgroups.push(Colgroup::Updatable(RwLock::new(store)));
            continue;
        }
        if new_row_num == 0 {
            remove_temp(entry);
            colgroups.push(Colgroup::Plain(Arc::new(EmptyStore::new())));
            continue;
        }
        if schema.use_fixed_len_store(cg) {
            let TempEntry { store, .. } = entry;
            let TempStore::Fixed(store) = store else {
                return Err(CoreError::logic("fixed colgroup temp is not fixed"));
            };
            colgroups.push(Colgroup::Plain(Arc::new(store)));
            continue;
        }
        let source = entry.store.as_store();
        let store: Arc<dyn ReadableStore> =
            if dict_zip_wanted(table, cg, source.data_inflate_size(), new_row_num) {
                Arc::new(DictZipStore::build(source, &|_| true)?)
            } else {
                build_chunked(table, cg, source)?
            };
        remove_temp(entry);
        colgroups.push(Colgroup::Plain(store));
    }

    // rows deleted before or during the passes stay addressable: purge bits
    // translate their logical ids past the missing store records
    let is_purged = (del_cnt > 0).then(|| RankSelect0::new(new_is_del.clone()));

    let built = ReadonlySegment::assemble(
        formal_dir.clone(),
        schema.clone(),
        new_is_del,
        is_purged,
        indexes,
        colgroups,
    );
    built.save(&tmp_dir)?;
    drop(built);
    let new_seg = Arc::new(ReadonlySegment::load(&tmp_dir, formal_dir.clone(), schema.clone())?);

    let drain = |new_seg: &ReadonlySegment| -> CoreResult<()> {
        let updates = input.core().drain_updates();
        if updates.is_empty() {
            return Ok(());
        }
        let mut cell = Vec::new();
        for id in updates.into_sorted_ids() {
            let id = u64::from(id);
            if input.core().is_deleted(id) {
                new_seg.core().set_del(id)?;
            } else {
                for pos in 0..schema.updatable_colgroups.len() {
                    cell.clear();
                    input_wr.read_cell_append(pos, id, &mut cell)?;
                    new_seg.write_updatable_cell(pos, new_seg.physical_id(id), &cell)?;
                }
            }
        }
        Ok(())
    };

    drain(&new_seg)?;
    {
        let _read = table.state.read();
        drain(&new_seg)?;
    }
    {
        let mut state = table.state.write();
        drain(&new_seg)?;
        debug_assert_eq!(new_seg.core().del_cnt(), input.core().del_cnt());
        state.segments[seg_idx] = new_seg.clone();
        state.seg_array_update_seq += 1;
        atomic_rename(&tmp_dir, &formal_dir)?;
        input.core().mark_to_be_del();
    }
    tracing::info!(dir = %formal_dir.display(), rows = new_row_num, "converted segment");
    Ok(())
}

/// Rebuilds the read-only segment at `seg_idx` without its deleted rows
/// and swaps it in, renumbering the table's id space. Returns false when
/// the swap was abandoned because a scan started mid-purge.
pub(crate) fn purge_segment(table: &Table, seg_idx: usize) -> CoreResult<bool> {
    let schema = table.schema.clone();
    let input: Arc<dyn Segment> = table.state.read().segments[seg_idx].clone();
    let input_rd = input.as_readonly().ok_or_else(|| {
        CoreError::logic(format!("purge input {seg_idx} is not read-only"))
    })?;
    tracing::info!(dir = %input.core().dir().display(), "purging segment");

    input.core().enable_book_updates();
    let dropped = input.core().snapshot_bits();
    let logic_rows = dropped.len();
    // old logical id -> new id, over the rows kept at snapshot time
    let keep_map = RankSelect0::new(dropped.clone());
    let new_rows = keep_map.max_rank0() as u64;

    let formal_dir = input.core().dir();
    let tmp_dir = tmp_sibling(&formal_dir);
    std::fs::create_dir_all(&tmp_dir)?;

    let mut indexes = Vec::with_capacity(schema.index_num());
    let mut rec = Vec::new();
    for i in 0..schema.index_num() {
        if new_rows == 0 {
            indexes.push(IndexHandles {
                index: Arc::new(EmptyIndexStore),
                store: Arc::new(EmptyStore::new()),
            });
            continue;
        }
        let store = input_rd.colgroup(i);
        let mut keys = SortableStrVec::new();
        let mut phys = 0u64;
        for logic in 0..logic_rows as u64 {
            if input_rd.is_purged_at(logic) {
                continue;
            }
            if !dropped.get(logic as usize) {
                rec.clear();
                store.get_value_append(phys, &mut rec)?;
                keys.push(&rec);
            }
            phys += 1;
        }
        indexes.push(build_index(
            &schema.indexes[i].schema,
            schema.indexes[i].unique,
            &keys,
        )?);
    }

    let mut colgroups: Vec<Colgroup> = Vec::with_capacity(schema.colgroup_num());
    for handles in &indexes {
        colgroups.push(Colgroup::Plain(handles.store.clone()));
    }
    for cg in schema.index_num()..schema.colgroup_num() {
        let cg_schema = &schema.colgroups[cg];
        let source = input_rd.colgroup(cg);
        let updatable = schema.updatable_colgroups.contains(&cg);
        if new_rows == 0 && !updatable {
            colgroups.push(Colgroup::Plain(Arc::new(EmptyStore::new())));
            continue;
        }
        if updatable || schema.use_fixed_len_store(cg) {
            let fixed_len = cg_schema
                .fixed_row_len()
                .ok_or_else(|| CoreError::logic("fixed colgroup without a fixed width"))?;
            let path = tmp_dir.join(format!("colgroup-{}.fixlen", cg_schema.name()));
            let mut store = FixedLenStore::create(&path, fixed_len)?;
            for_each_kept(input_rd, &dropped, |_, phys| {
                rec.clear();
                source.get_value_append(phys, &mut rec)?;
                store.append(&rec)?;
                Ok(())
            })?;
            colgroups.push(if updatable {
                Colgroup::Updatable(RwLock::new(store))
            } else {
                Colgroup::Plain(Arc::new(store))
            });
            continue;
        }
        let kept_inflate = source.data_inflate_size();
        if dict_zip_wanted(table, cg, kept_inflate, source.num_rows().max(1)) {
            let keep = |phys: u64| !dropped.get(input_rd.logical_id(phys) as usize);
            let store = match source {
                Colgroup::Plain(plain) => DictZipStore::build(plain.as_ref(), &keep)?,
                Colgroup::Updatable(_) => {
                    return Err(CoreError::logic("updatable colgroup on the dict-zip path"))
                }
            };
            colgroups.push(Colgroup::Plain(Arc::new(store)));
            continue;
        }
        let budget = table.config.compressing_work_mem_size;
        let mut parts: Vec<Arc<dyn ReadableStore>> = Vec::new();
        let mut chunk = SortableStrVec::new();
        for_each_kept(input_rd, &dropped, |_, phys| {
            if chunk.mem_size() >= budget && !chunk.is_empty() {
                parts.push(build_store(cg_schema, &chunk)?);
                chunk.clear();
            }
            rec.clear();
            source.get_value_append(phys, &mut rec)?;
            chunk.push(&rec);
            Ok(())
        })?;
        if !chunk.is_empty() || parts.is_empty() {
            parts.push(build_store(cg_schema, &chunk)?);
        }
        colgroups.push(Colgroup::Plain(if parts.len() == 1 {
            parts.pop().expect("one part")
        } else {
            Arc::new(MultiPartStore::new(parts))
        }));
    }

    let built = ReadonlySegment::assemble(
        formal_dir.clone(),
        schema.clone(),
        BitVec::with_len(new_rows as usize, false),
        None,
        indexes,
        colgroups,
    );
    built.save(&tmp_dir)?;
    drop(built);
    let new_seg = Arc::new(ReadonlySegment::load(&tmp_dir, formal_dir.clone(), schema.clone())?);

    let drain = |new_seg: &ReadonlySegment| -> CoreResult<()> {
        let updates = input.core().drain_updates();
        if updates.is_empty() {
            return Ok(());
        }
        let mut cell = Vec::new();
        for old_id in updates.into_sorted_ids() {
            let old_id = u64::from(old_id);
            if dropped.get(old_id as usize) {
                // dropped at snapshot time; nothing of it survives
                continue;
            }
            let new_id = keep_map.rank0(old_id as usize) as u64;
            if input.core().is_deleted(old_id) {
                new_seg.core().set_del(new_id)?;
            } else {
                for pos in 0..schema.updatable_colgroups.len() {
                    cell.clear();
                    input_rd.read_updatable_cell(pos, input_rd.physical_id(old_id), &mut cell)?;
                    new_seg.write_updatable_cell(pos, new_id, &cell)?;
                }
            }
        }
        Ok(())
    };

    drain(&new_seg)?;
    {
        let _read = table.state.read();
        drain(&new_seg)?;
    }
    {
        let mut state = table.state.write();
        if state.scanning_refcount > 0 {
            // a scan started mid-purge; its ids must stay stable
            drop(state);
            tracing::warn!(dir = %formal_dir.display(), "purge abandoned: scan in progress");
            input.core().disable_book_updates();
            let _ = std::fs::remove_dir_all(&tmp_dir);
            return Ok(false);
        }
        drain(&new_seg)?;

        let backup_dir = crate::dir::TableDir::backup_dir(&formal_dir);
        std::fs::rename(&formal_dir, &backup_dir)?;
        if let Err(err) = atomic_rename(&tmp_dir, &formal_dir) {
            // put the input back; the table keeps its prior state
            std::fs::rename(&backup_dir, &formal_dir)?;
            return Err(err.into());
        }
        input.core().set_dir(backup_dir);
        input.core().mark_to_be_del();

        state.segments[seg_idx] = new_seg.clone();
        let state = &mut *state;
        let mut total = 0u64;
        for (i, seg) in state.segments.iter().enumerate() {
            state.row_num_vec[i] = total;
            total += seg.num_rows();
        }
        let last = state.row_num_vec.len() - 1;
        state.row_num_vec[last] = total;
        state.seg_array_update_seq += 1;
    }
    tracing::info!(
        dir = %formal_dir.display(),
        rows = new_rows,
        dropped = logic_rows as u64 - new_rows,
        "purged segment"
    );
    Ok(true)
}

/// Calls `f(logic, phys)` for every row kept at snapshot time, with the
/// physical id valid in the input segment's stores.
fn for_each_kept(
    input: &ReadonlySegment,
    dropped: &BitVec,
    mut f: impl FnMut(u64, u64) -> CoreResult<()>,
) -> CoreResult<()> {
    for logic in 0..dropped.len() as u64 {
        if input.has_purge_bits() && input.is_purged_at(logic) {
            continue;
        }
        if dropped.get(logic as usize) {
            continue;
        }
        f(logic, input.physical_id(logic))?;
    }
    Ok(())
}
