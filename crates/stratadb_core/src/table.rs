//! The composite table: one logical row space over many segments.
//!
//! Logical row ids are assigned at insert and stay valid until the row is
//! removed. The table keeps a prefix-sum `row_num_vec` (`row_num_vec[i]` =
//! logical rows in segments `[0..i)`, one trailing entry for the running
//! total), so locating the owning segment of an id is one binary search.
//! The last segment is always the writable tail; everything before it is
//! frozen, and the background drivers ([`Table::compact`],
//! [`Table::purge_deleted_rows`]) migrate frozen segments into compressed
//! read-only ones while reads and writes continue.

use crate::config::TableConfig;
use crate::context::TableCtx;
use crate::dir::{TableDir, TableMeta};
use crate::error::{CoreError, CoreResult};
use crate::schema::{IndexDef, Schema, TableSchema};
use crate::segment::{convert_segment, purge_segment, Segment, WritableSegment, ReadonlySegment};
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State guarded by the table's primary reader/writer lock.
pub(crate) struct TableState {
    pub(crate) segments: Vec<Arc<dyn Segment>>,
    /// Prefix sums: `row_num_vec[i]` = rows in segments `[0..i)`; the last
    /// entry is the running total, bumped per append.
    pub(crate) row_num_vec: Vec<u64>,
    pub(crate) tail: Arc<WritableSegment>,
    /// Tail sub-ids freed by `remove_row`, available for reuse.
    pub(crate) deleted_wr_ids: Vec<u32>,
    /// Live full-table iterators.
    pub(crate) scanning_refcount: u32,
    /// Bumped on every segment-array swap.
    pub(crate) seg_array_update_seq: u64,
}

impl TableState {
    fn tail_base(&self) -> u64 {
        self.row_num_vec[self.row_num_vec.len() - 2]
    }

    fn total_rows(&self) -> u64 {
        *self.row_num_vec.last().expect("row_num_vec is never empty")
    }

    fn min_wr_seg(&self) -> usize {
        self.segments
            .iter()
            .position(|s| s.as_writable().is_some())
            .unwrap_or(self.segments.len())
    }

    /// Owning segment index for `id`: last `j` with `row_num_vec[j] <= id`.
    fn seg_of(&self, id: u64) -> usize {
        self.row_num_vec.partition_point(|&base| base <= id) - 1
    }
}

/// A segmented column-group table.
pub struct Table {
    name: String,
    dir: TableDir,
    pub(crate) config: TableConfig,
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) state: RwLock<TableState>,
    compacting: AtomicBool,
    purging: AtomicBool,
}

impl Table {
    /// Creates a new table under `{dir}/{name}/` with an empty writable
    /// tail.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyInitialized`] when segment directories already
    /// exist; [`CoreError::InvalidArgument`] for schema problems.
    pub fn create(
        dir: &Path,
        name: &str,
        row_schema: Schema,
        index_defs: &[IndexDef],
        config: TableConfig,
    ) -> CoreResult<Arc<Self>> {
        let tdir = TableDir::open(dir, name)?;
        let existing = tdir.count_seg_dirs()?;
        if existing > 0 {
            return Err(CoreError::AlreadyInitialized { segments: existing });
        }
        let schema = Arc::new(TableSchema::build(row_schema, index_defs)?);

        let tail = Arc::new(WritableSegment::create(tdir.seg_dir("wr", 0), schema.clone())?);
        let state = TableState {
            segments: vec![tail.clone()],
            row_num_vec: vec![0, 0],
            tail,
            deleted_wr_ids: Vec::new(),
            scanning_refcount: 0,
            seg_array_update_seq: 0,
        };
        let table = Self {
            name: name.to_string(),
            dir: tdir,
            config,
            schema,
            state: RwLock::new(state),
            compacting: AtomicBool::new(false),
            purging: AtomicBool::new(false),
        };
        table.save_meta(&table.state.read())?;
        tracing::info!(table = %table.name, "created table");
        Ok(Arc::new(table))
    }

    /// Opens an existing table, adopting the last writable segment as the
    /// tail when it still has room, else starting a fresh one.
    pub fn open(dir: &Path, name: &str) -> CoreResult<Arc<Self>> {
        let tdir = TableDir::open(dir, name)?;
        let meta = tdir.load_meta()?.ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "no table metadata under {}",
                tdir.root().display()
            ))
        })?;
        let schema = Arc::new(TableSchema::build(meta.row_schema()?, &meta.index_defs())?);
        let config = TableConfig::default()
            .max_wr_seg_size(meta.max_wr_seg_size)
            .readonly_data_mem_size(meta.readonly_data_mem_size);

        let mut segments: Vec<Arc<dyn Segment>> = Vec::with_capacity(meta.total_seg_num + 1);
        let mut row_num_vec = Vec::with_capacity(meta.total_seg_num + 2);
        row_num_vec.push(0);
        let mut rows = 0u64;
        for idx in 0..meta.min_wr_seg {
            let seg_dir = tdir.seg_dir("rd", idx);
            let seg = Arc::new(ReadonlySegment::load(&seg_dir, seg_dir.clone(), schema.clone())?);
            rows += seg.num_rows();
            segments.push(seg);
            row_num_vec.push(rows);
        }
        let mut last_writable: Option<Arc<WritableSegment>> = None;
        for idx in meta.min_wr_seg..meta.total_seg_num {
            let seg = Arc::new(WritableSegment::open(tdir.seg_dir("wr", idx), schema.clone())?);
            rows += seg.num_rows();
            last_writable = Some(seg.clone());
            segments.push(seg);
            row_num_vec.push(rows);
        }

        let tail = match last_writable {
            // adopt: the last on-disk writable segment keeps growing
            Some(seg) if seg.data_storage_size() < meta.max_wr_seg_size => seg,
            _ => {
                let seg = Arc::new(WritableSegment::create(
                    tdir.seg_dir("wr", meta.total_seg_num),
                    schema.clone(),
                )?);
                segments.push(seg.clone());
                // duplicated entry: the new tail starts empty
                row_num_vec.push(rows);
                seg
            }
        };
        for seg in &segments[..segments.len() - 1] {
            if seg.as_writable().is_some() {
                seg.core().freeze();
            }
        }

        let state = TableState {
            segments,
            row_num_vec,
            tail,
            deleted_wr_ids: Vec::new(),
            scanning_refcount: 0,
            seg_array_update_seq: 0,
        };
        let table = Self {
            name: name.to_string(),
            dir: tdir,
            config,
            schema,
            state: RwLock::new(state),
            compacting: AtomicBool::new(false),
            purging: AtomicBool::new(false),
        };
        table.save_meta(&table.state.read())?;
        tracing::info!(
            table = %table.name,
            segments = table.state.read().segments.len(),
            "opened table"
        );
        Ok(Arc::new(table))
    }

    fn save_meta(&self, state: &TableState) -> CoreResult<()> {
        let index_entries = self
            .schema
            .indexes
            .iter()
            .map(|ix| {
                TableMeta::index_entry(&IndexDef {
                    columns: (0..ix.schema.column_num())
                        .map(|i| ix.schema.column(i).name.clone())
                        .collect(),
                    unique: ix.unique,
                })
            })
            .collect();
        self.dir.save_meta(&TableMeta {
            total_seg_num: state.segments.len(),
            min_wr_seg: state.min_wr_seg(),
            max_wr_seg_size: self.config.max_wr_seg_size,
            readonly_data_mem_size: self.config.readonly_data_mem_size,
            row_schema: self.schema.row.to_meta_rows(),
            table_index: index_entries,
        })
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table schema.
    #[must_use]
    pub fn table_schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Creates a fresh scratch context for this table.
    #[must_use]
    pub fn new_ctx(&self) -> TableCtx {
        TableCtx::new()
    }

    /// Total logical rows (deleted rows included).
    #[must_use]
    pub fn num_data_rows(&self) -> u64 {
        self.state.read().total_rows()
    }

    /// Bytes of row data across all segments.
    #[must_use]
    pub fn data_storage_size(&self) -> u64 {
        let state = self.state.read();
        state.segments.iter().map(|s| s.data_storage_size()).sum()
    }

    /// Bytes of row data, indexes, and bitmaps across all segments.
    #[must_use]
    pub fn total_storage_size(&self) -> u64 {
        let state = self.state.read();
        state.segments.iter().map(|s| s.total_storage_size()).sum()
    }

    /// Reads the row at `id` into `out`. Returns false when the row is
    /// deleted.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidArgument`] when `id` was never assigned.
    pub fn get_value(&self, id: u64, out: &mut Vec<u8>, ctx: &mut TableCtx) -> CoreResult<bool> {
        out.clear();
        let state = self.state.read();
        if id >= state.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                state.total_rows()
            )));
        }
        let j = state.seg_of(id);
        let sub_id = id - state.row_num_vec[j];
        let seg = &state.segments[j];
        if seg.core().is_deleted(sub_id) {
            return Ok(false);
        }
        seg.get_value_append(sub_id, out, ctx)?;
        Ok(true)
    }

    /// Inserts a row; returns its logical id.
    ///
    /// With `sync_index` the row is projected into every index key and
    /// inserted synchronously. A duplicate key under a unique index is not
    /// rolled back; the index keeps both ids and logs the violation.
    pub fn insert_row(&self, row: &[u8], sync_index: bool, ctx: &mut TableCtx) -> CoreResult<u64> {
        let guard = self.state.upgradable_read();
        self.insert_impl(row, sync_index, ctx, guard)
    }

    fn insert_impl(
        &self,
        row: &[u8],
        sync_index: bool,
        ctx: &mut TableCtx,
        guard: RwLockUpgradableReadGuard<'_, TableState>,
    ) -> CoreResult<u64> {
        let guard = self.maybe_rotate_tail(guard)?;
        if sync_index {
            self.schema.row.parse_row(row, &mut ctx.cols1)?;
        }
        let mut state = RwLockUpgradableReadGuard::upgrade(guard);
        let tail = state.tail.clone();
        let sub_id = if !state.deleted_wr_ids.is_empty() && state.scanning_refcount == 0 {
            let sub_id = u64::from(state.deleted_wr_ids.pop().expect("checked non-empty"));
            tail.replace_at(sub_id, row, ctx)?;
            tail.core().clear_del(sub_id)?;
            sub_id
        } else {
            let sub_id = tail.append(row, ctx)?;
            tail.core().push_row()?;
            *state.row_num_vec.last_mut().expect("non-empty") += 1;
            sub_id
        };
        if sync_index {
            // cols1 ranges from the pre-upgrade parse still index into row
            for i in 0..self.schema.index_num() {
                ctx.key1.clear();
                self.schema.index_key_append(i, &ctx.cols1, row, &mut ctx.key1);
                tail.index(i).insert(&ctx.key1, sub_id as u32);
            }
        }
        Ok(state.tail_base() + sub_id)
    }

    fn maybe_rotate_tail<'a>(
        &self,
        guard: RwLockUpgradableReadGuard<'a, TableState>,
    ) -> CoreResult<RwLockUpgradableReadGuard<'a, TableState>> {
        if guard.tail.data_storage_size() < self.config.max_wr_seg_size {
            return Ok(guard);
        }
        if guard.segments.len() >= self.config.max_segments {
            return Err(CoreError::TooManySegments {
                limit: self.config.max_segments,
            });
        }
        let new_dir = self.dir.seg_dir("wr", guard.segments.len());
        let seg = Arc::new(WritableSegment::create(new_dir, self.schema.clone())?);

        let mut state = RwLockUpgradableReadGuard::upgrade(guard);
        state.tail.core().freeze();
        state.tail = seg.clone();
        state.segments.push(seg);
        let total = state.total_rows();
        state.row_num_vec.push(total);
        state.deleted_wr_ids.clear();
        state.seg_array_update_seq += 1;
        tracing::info!(
            table = %self.name,
            segments = state.segments.len(),
            "rotated writable tail"
        );
        self.save_meta(&state)?;
        Ok(RwLockWriteGuard::downgrade_to_upgradable(state))
    }

    /// Replaces the row at `id`. In the tail the row is rewritten in place
    /// and `id` is returned; in a frozen segment the old row is marked
    /// deleted and the new row is inserted, returning the new id.
    pub fn replace_row(
        &self,
        id: u64,
        row: &[u8],
        sync_index: bool,
        ctx: &mut TableCtx,
    ) -> CoreResult<u64> {
        let guard = self.state.upgradable_read();
        if id >= guard.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                guard.total_rows()
            )));
        }
        let j = guard.seg_of(id);
        let sub_id = id - guard.row_num_vec[j];
        if guard.segments[j].core().is_deleted(sub_id) {
            return Err(CoreError::invalid_argument(format!("row {id} is deleted")));
        }
        if j == guard.segments.len() - 1 {
            let tail = guard.tail.clone();
            if sync_index {
                ctx.buf2.clear();
                let mut old_row = std::mem::take(&mut ctx.buf2);
                tail.get_value_append(sub_id, &mut old_row, ctx)?;
                self.schema.row.parse_row(&old_row, &mut ctx.cols3)?;
                self.schema.row.parse_row(row, &mut ctx.cols1)?;
                let state = RwLockUpgradableReadGuard::upgrade(guard);
                for i in 0..self.schema.index_num() {
                    ctx.key1.clear();
                    ctx.key2.clear();
                    self.schema.index_key_append(i, &ctx.cols3, &old_row, &mut ctx.key2);
                    self.schema.index_key_append(i, &ctx.cols1, row, &mut ctx.key1);
                    if ctx.key1 != ctx.key2 {
                        tail.index(i).remove(&ctx.key2, sub_id as u32);
                        tail.index(i).insert(&ctx.key1, sub_id as u32);
                    }
                }
                ctx.buf2 = old_row;
                tail.replace_at(sub_id, row, ctx)?;
                drop(state);
            } else {
                let _state = RwLockUpgradableReadGuard::upgrade(guard);
                tail.replace_at(sub_id, row, ctx)?;
            }
            Ok(id)
        } else {
            let state = RwLockUpgradableReadGuard::upgrade(guard);
            state.segments[j].core().set_del(sub_id)?;
            let guard = RwLockWriteGuard::downgrade_to_upgradable(state);
            self.insert_impl(row, sync_index, ctx, guard)
        }
    }

    /// Removes the row at `id`. Tail rows are physically removed (and their
    /// sub-id parked for reuse); frozen rows are marked deleted.
    pub fn remove_row(&self, id: u64, sync_index: bool, ctx: &mut TableCtx) -> CoreResult<()> {
        let guard = self.state.upgradable_read();
        if id >= guard.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                guard.total_rows()
            )));
        }
        let j = guard.seg_of(id);
        let sub_id = id - guard.row_num_vec[j];
        if guard.segments[j].core().is_deleted(sub_id) {
            return Err(CoreError::invalid_argument(format!("row {id} is deleted")));
        }
        if j == guard.segments.len() - 1 {
            let tail = guard.tail.clone();
            if sync_index {
                ctx.buf2.clear();
                let mut old_row = std::mem::take(&mut ctx.buf2);
                tail.get_value_append(sub_id, &mut old_row, ctx)?;
                self.schema.row.parse_row(&old_row, &mut ctx.cols1)?;
                let mut state = RwLockUpgradableReadGuard::upgrade(guard);
                for i in 0..self.schema.index_num() {
                    ctx.key1.clear();
                    self.schema.index_key_append(i, &ctx.cols1, &old_row, &mut ctx.key1);
                    tail.index(i).remove(&ctx.key1, sub_id as u32);
                }
                ctx.buf2 = old_row;
                tail.remove(sub_id)?;
                tail.core().set_del(sub_id)?;
                state.deleted_wr_ids.push(sub_id as u32);
            } else {
                let mut state = RwLockUpgradableReadGuard::upgrade(guard);
                tail.remove(sub_id)?;
                tail.core().set_del(sub_id)?;
                state.deleted_wr_ids.push(sub_id as u32);
            }
        } else {
            let state = RwLockUpgradableReadGuard::upgrade(guard);
            state.segments[j].core().set_del(sub_id)?;
        }
        Ok(())
    }

    /// Rewrites one in-place-updatable cell of a live row, in any
    /// writable-backed or read-only segment.
    pub fn update_inplace_column(
        &self,
        id: u64,
        column_id: usize,
        cell: &[u8],
        _ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        if column_id >= self.schema.row.column_num() {
            return Err(CoreError::invalid_argument(format!(
                "column id {column_id} out of range"
            )));
        }
        let proj = self.schema.col_project[column_id];
        let Some(pos) = self
            .schema
            .updatable_colgroups
            .iter()
            .position(|&cg| cg == proj.colgroup)
        else {
            return Err(CoreError::invalid_argument(format!(
                "column {} is not in-place updatable",
                self.schema.row.column(column_id).name
            )));
        };
        let state = self.state.read();
        if id >= state.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                state.total_rows()
            )));
        }
        let j = state.seg_of(id);
        let sub_id = id - state.row_num_vec[j];
        let seg = &state.segments[j];
        if seg.core().is_deleted(sub_id) {
            return Err(CoreError::invalid_argument(format!("row {id} is deleted")));
        }
        if let Some(wr) = seg.as_writable() {
            wr.update_cell(pos, sub_id, cell)
        } else if let Some(rd) = seg.as_readonly() {
            rd.update_cell(pos, sub_id, cell)
        } else {
            Err(CoreError::logic("segment is neither writable nor read-only"))
        }
    }

    fn check_index_id(&self, index_id: usize) -> CoreResult<()> {
        if index_id >= self.schema.index_num() {
            return Err(CoreError::invalid_argument(format!(
                "index id {index_id} out of range, indexes={}",
                self.schema.index_num()
            )));
        }
        Ok(())
    }

    fn tail_sub_id(state: &TableState, id: u64) -> CoreResult<u64> {
        let tail_base = state.tail_base();
        if id < tail_base || id >= state.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} is not in the writable tail (tail starts at {tail_base})"
            )));
        }
        Ok(id - tail_base)
    }

    /// Inserts `(key, id)` into index `index_id`. The row must live in the
    /// tail.
    pub fn index_insert(
        &self,
        index_id: usize,
        key: &[u8],
        id: u64,
        _ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        self.check_index_id(index_id)?;
        let state = self.state.write();
        let sub_id = Self::tail_sub_id(&state, id)?;
        state.tail.index(index_id).insert(key, sub_id as u32);
        Ok(())
    }

    /// Removes `(key, id)` from index `index_id`. The row must live in the
    /// tail.
    pub fn index_remove(
        &self,
        index_id: usize,
        key: &[u8],
        id: u64,
        _ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        self.check_index_id(index_id)?;
        let state = self.state.write();
        let sub_id = Self::tail_sub_id(&state, id)?;
        state.tail.index(index_id).remove(key, sub_id as u32);
        Ok(())
    }

    /// Moves `key` from `old_id` to `new_id` in index `index_id`. Both rows
    /// must live in the tail.
    pub fn index_replace(
        &self,
        index_id: usize,
        key: &[u8],
        old_id: u64,
        new_id: u64,
        _ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        self.check_index_id(index_id)?;
        if old_id == new_id {
            return Ok(());
        }
        let state = self.state.write();
        let old_sub = Self::tail_sub_id(&state, old_id)?;
        let new_sub = Self::tail_sub_id(&state, new_id)?;
        state
            .tail
            .index(index_id)
            .replace(key, old_sub as u32, new_sub as u32);
        Ok(())
    }

    /// Appends the logical ids of live rows whose index key equals `key`,
    /// across every segment.
    pub fn index_search_exact(
        &self,
        index_id: usize,
        key: &[u8],
        out_ids: &mut Vec<u64>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        self.check_index_id(index_id)?;
        out_ids.clear();
        let state = self.state.read();
        for (j, seg) in state.segments.iter().enumerate() {
            let base = state.row_num_vec[j];
            let before = out_ids.len();
            seg.index_search_exact_append(index_id, key, out_ids, ctx)?;
            for id in &mut out_ids[before..] {
                *id += base;
            }
        }
        Ok(())
    }

    /// Projects `column_ids` of the row at `id` into `out`.
    pub fn select_columns(
        &self,
        id: u64,
        column_ids: &[usize],
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<bool> {
        out.clear();
        for &col in column_ids {
            if col >= self.schema.row.column_num() {
                return Err(CoreError::invalid_argument(format!(
                    "column id {col} out of range"
                )));
            }
        }
        let state = self.state.read();
        if id >= state.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                state.total_rows()
            )));
        }
        let j = state.seg_of(id);
        let sub_id = id - state.row_num_vec[j];
        let seg = &state.segments[j];
        if seg.core().is_deleted(sub_id) {
            return Ok(false);
        }
        seg.select_columns(sub_id, column_ids, out, ctx)?;
        Ok(true)
    }

    /// Projects one column of the row at `id` into `out`.
    pub fn select_one_column(
        &self,
        id: u64,
        column_id: usize,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<bool> {
        out.clear();
        if column_id >= self.schema.row.column_num() {
            return Err(CoreError::invalid_argument(format!(
                "column id {column_id} out of range"
            )));
        }
        let state = self.state.read();
        if id >= state.total_rows() {
            return Err(CoreError::invalid_argument(format!(
                "row id {id} out of range, rows={}",
                state.total_rows()
            )));
        }
        let j = state.seg_of(id);
        let sub_id = id - state.row_num_vec[j];
        let seg = &state.segments[j];
        if seg.core().is_deleted(sub_id) {
            return Ok(false);
        }
        seg.select_one_column(sub_id, column_id, out, ctx)?;
        Ok(true)
    }

    /// Creates a forward scan over all live rows. While any iterator is
    /// alive, deleted tail ids are not reused and `compact` is a no-op.
    pub fn create_store_iter(self: &Arc<Self>) -> TableIter {
        self.state.write().scanning_refcount += 1;
        TableIter {
            table: self.clone(),
            seg_idx: 0,
            sub_id: 0,
            ctx: TableCtx::new(),
        }
    }

    /// Converts every frozen writable segment into a compressed read-only
    /// segment. Returns false (doing nothing) while a scan is live or there
    /// is nothing to convert.
    pub fn compact(&self) -> CoreResult<bool> {
        if self.compacting.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = (|| {
            let (first, last) = {
                let state = self.state.read();
                if state.scanning_refcount > 0 || state.segments.len() < 2 {
                    return Ok(false);
                }
                let last = state.segments.len() - 1;
                let mut first = last;
                while first > 0 && state.segments[first - 1].as_writable().is_some() {
                    first -= 1;
                }
                (first, last)
            };
            if first == last {
                return Ok(false);
            }
            for idx in first..last {
                convert_segment(self, idx)?;
            }
            self.save_meta(&self.state.read())?;
            Ok(true)
        })();
        self.compacting.store(false, Ordering::Release);
        result
    }

    /// Rebuilds the read-only segment at `seg_idx` without its deleted
    /// rows, compacting the table's id space. Returns false while a scan is
    /// live or another purge is running.
    pub fn purge_deleted_rows(&self, seg_idx: usize) -> CoreResult<bool> {
        if self.purging.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let result = (|| {
            {
                let state = self.state.read();
                if state.scanning_refcount > 0 {
                    return Ok(false);
                }
                let seg = state.segments.get(seg_idx).ok_or_else(|| {
                    CoreError::invalid_argument(format!("segment index {seg_idx} out of range"))
                })?;
                if seg.as_readonly().is_none() {
                    return Err(CoreError::invalid_argument(format!(
                        "segment {seg_idx} is not read-only"
                    )));
                }
            }
            let swapped = purge_segment(self, seg_idx)?;
            if swapped {
                self.save_meta(&self.state.read())?;
            }
            Ok(swapped)
        })();
        self.purging.store(false, Ordering::Release);
        result
    }

    /// Number of segments, the tail included.
    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Per-segment snapshot counters.
    #[must_use]
    pub fn segment_stats(&self) -> Vec<SegmentStat> {
        let state = self.state.read();
        state
            .segments
            .iter()
            .map(|seg| SegmentStat {
                rows: seg.num_rows(),
                deleted: seg.core().del_cnt(),
                frozen: seg.core().is_frozen(),
                read_only: seg.as_readonly().is_some(),
                has_purge_bits: seg.as_readonly().is_some_and(|rd| rd.has_purge_bits()),
            })
            .collect()
    }

    /// Flushes the tail's row store and bitmaps.
    pub fn flush(&self) -> CoreResult<()> {
        let tail = self.state.read().tail.clone();
        tail.flush()
    }

    /// The directory backing segment `seg_idx` (rd/wr naming included).
    pub(crate) fn seg_dir(&self, kind: &str, idx: usize) -> std::path::PathBuf {
        self.dir.seg_dir(kind, idx)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(table = %self.name, %err, "flush on close failed");
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("segments", &state.segments.len())
            .field("rows", &state.total_rows())
            .finish_non_exhaustive()
    }
}

/// Point-in-time counters for one segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStat {
    /// Logical rows, deleted ones included.
    pub rows: u64,
    /// Deletion-bit popcount.
    pub deleted: usize,
    /// Whether the segment no longer accepts appends.
    pub frozen: bool,
    /// Whether the segment is compressed read-only.
    pub read_only: bool,
    /// Whether reads translate logical ids over purge bits.
    pub has_purge_bits: bool,
}

/// Forward scan over all live rows of a table.
///
/// Holds the table's scanning refcount for its lifetime, which pins
/// logical ids: inserts will not reuse removed tail ids, and compaction
/// stands down.
pub struct TableIter {
    table: Arc<Table>,
    seg_idx: usize,
    sub_id: u64,
    ctx: TableCtx,
}

impl TableIter {
    /// Reads the next live row into `out`; returns its logical id, or
    /// `None` at the end of the table.
    pub fn next_row(&mut self, out: &mut Vec<u8>) -> CoreResult<Option<u64>> {
        loop {
            let (seg, base, rows) = {
                let state = self.table.state.read();
                if self.seg_idx >= state.segments.len() {
                    return Ok(None);
                }
                let seg = state.segments[self.seg_idx].clone();
                let rows = seg.num_rows();
                (seg, state.row_num_vec[self.seg_idx], rows)
            };
            while self.sub_id < rows {
                let sub = self.sub_id;
                self.sub_id += 1;
                if seg.core().is_deleted(sub) {
                    continue;
                }
                if let Some(wr) = seg.as_writable() {
                    if !wr.row_present(sub) {
                        continue;
                    }
                }
                out.clear();
                seg.get_value_append(sub, out, &mut self.ctx)?;
                return Ok(Some(base + sub));
            }
            self.seg_idx += 1;
            self.sub_id = 0;
        }
    }
}

impl Drop for TableIter {
    fn drop(&mut self) {
        self.table.state.write().scanning_refcount -= 1;
    }
}
