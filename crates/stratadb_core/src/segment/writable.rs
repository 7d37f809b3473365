//! Writable segments: the tail and frozen-but-not-yet-converted segments.
//!
//! Rows are split on arrival: columns outside the in-place-updatable
//! colgroups go to the append-only row store (`__wrtStore__`, a replayable
//! record log), updatable colgroups keep one mmap-backed fixed-length store
//! each so their cells can be rewritten without touching the row. Reads
//! recombine the freshest pieces. Mutable indexes are rebuilt from the row
//! store on open rather than persisted.

use crate::context::TableCtx;
use crate::error::{CoreError, CoreResult};
use crate::index::MutableIndex;
use crate::schema::TableSchema;
use crate::segment::{isdel_path, SegCore, Segment};
use crate::store::{FixedLenStore, ReadableStore};
use crate::bitmap::DelBitmap;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WRT_STORE_FILE: &str = "__wrtStore__";

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Append-only row store with positional rewrite, backed by a record log.
///
/// Log record: op byte, sub-id u32, payload length u32, payload. Replaying
/// the log rebuilds the offset table; a truncated trailing record is cut
/// off.
struct WrtStore {
    rows: Vec<Option<(u64, u32)>>,
    pool: Vec<u8>,
    log: BufWriter<File>,
    log_bytes: u64,
}

impl WrtStore {
    fn create(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            rows: Vec::new(),
            pool: Vec::new(),
            log: BufWriter::new(file),
            log_bytes: 0,
        })
    }

    fn open(path: &Path) -> CoreResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut rows: Vec<Option<(u64, u32)>> = Vec::new();
        let mut pool = Vec::new();
        let mut pos = 0usize;
        let mut valid = 0usize;
        while pos + 9 <= data.len() {
            let op = data[pos];
            let sub = u32::from_le_bytes(data[pos + 1..pos + 5].try_into().unwrap()) as usize;
            let len = u32::from_le_bytes(data[pos + 5..pos + 9].try_into().unwrap()) as usize;
            if pos + 9 + len > data.len() {
                break;
            }
            if rows.len() < sub + 1 {
                rows.resize(sub + 1, None);
            }
            match op {
                OP_PUT => {
                    let off = pool.len() as u64;
                    pool.extend_from_slice(&data[pos + 9..pos + 9 + len]);
                    rows[sub] = Some((off, len as u32));
                }
                OP_REMOVE => rows[sub] = None,
                other => {
                    return Err(CoreError::corruption(format!(
                        "bad row-store op {other} at {pos}: {}",
                        path.display()
                    )))
                }
            }
            pos += 9 + len;
            valid = pos;
        }
        if valid < data.len() {
            tracing::warn!(
                path = %path.display(),
                dropped = data.len() - valid,
                "truncating torn tail of the writable row store"
            );
            file.set_len(valid as u64)?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            rows,
            pool,
            log: BufWriter::new(file),
            log_bytes: valid as u64,
        })
    }

    fn log_record(&mut self, op: u8, sub: u32, payload: &[u8]) -> CoreResult<()> {
        self.log.write_all(&[op])?;
        self.log.write_all(&sub.to_le_bytes())?;
        self.log.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.log.write_all(payload)?;
        self.log_bytes += 9 + payload.len() as u64;
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> CoreResult<u64> {
        let sub = self.rows.len() as u64;
        self.log_record(OP_PUT, sub as u32, record)?;
        let off = self.pool.len() as u64;
        self.pool.extend_from_slice(record);
        self.rows.push(Some((off, record.len() as u32)));
        Ok(sub)
    }

    fn put_at(&mut self, sub: u64, record: &[u8]) -> CoreResult<()> {
        if sub >= self.rows.len() as u64 {
            return Err(CoreError::OutOfRange {
                id: sub,
                rows: self.rows.len() as u64,
            });
        }
        self.log_record(OP_PUT, sub as u32, record)?;
        let off = self.pool.len() as u64;
        self.pool.extend_from_slice(record);
        self.rows[sub as usize] = Some((off, record.len() as u32));
        Ok(())
    }

    fn remove(&mut self, sub: u64) -> CoreResult<()> {
        if sub >= self.rows.len() as u64 {
            return Err(CoreError::OutOfRange {
                id: sub,
                rows: self.rows.len() as u64,
            });
        }
        self.log_record(OP_REMOVE, sub as u32, &[])?;
        self.rows[sub as usize] = None;
        Ok(())
    }

    /// Appends the record at `sub`; false when the slot was removed.
    fn get_append(&self, sub: u64, out: &mut Vec<u8>) -> CoreResult<bool> {
        let slot = self
            .rows
            .get(sub as usize)
            .ok_or(CoreError::OutOfRange {
                id: sub,
                rows: self.rows.len() as u64,
            })?;
        match slot {
            Some((off, len)) => {
                out.extend_from_slice(&self.pool[*off as usize..*off as usize + *len as usize]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn num_rows(&self) -> u64 {
        self.rows.len() as u64
    }

    fn data_size(&self) -> u64 {
        self.pool.len() as u64 + self.rows.len() as u64 * 16
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.log.flush()?;
        self.log.get_ref().sync_data()?;
        Ok(())
    }
}

/// A segment that accepts mutations.
pub struct WritableSegment {
    core: SegCore,
    schema: Arc<TableSchema>,
    wrt: RwLock<WrtStore>,
    // one store per entry of schema.updatable_colgroups, same order
    updatable: Vec<RwLock<FixedLenStore>>,
    indexes: Vec<MutableIndex>,
}

impl WritableSegment {
    /// Creates a fresh segment directory.
    pub fn create(dir: PathBuf, schema: Arc<TableSchema>) -> CoreResult<Self> {
        std::fs::create_dir_all(&dir)?;
        let is_del = DelBitmap::create(&isdel_path(&dir))?;
        let wrt = WrtStore::create(&dir.join(WRT_STORE_FILE))?;
        let mut updatable = Vec::with_capacity(schema.updatable_colgroups.len());
        for &cg in &schema.updatable_colgroups {
            let cg_schema = &schema.colgroups[cg];
            let fixed_len = cg_schema
                .fixed_row_len()
                .ok_or_else(|| CoreError::logic("updatable colgroup is not fixed width"))?;
            let path = dir.join(format!("colgroup-{}.fixlen", cg_schema.name()));
            updatable.push(RwLock::new(FixedLenStore::create(&path, fixed_len)?));
        }
        let indexes = schema
            .indexes
            .iter()
            .map(|ix| MutableIndex::new(ix.unique))
            .collect();
        Ok(Self {
            core: SegCore::new(dir, is_del),
            schema,
            wrt: RwLock::new(wrt),
            updatable,
            indexes,
        })
    }

    /// Opens an existing segment directory, rebuilding the mutable indexes
    /// from the row store.
    pub fn open(dir: PathBuf, schema: Arc<TableSchema>) -> CoreResult<Self> {
        let is_del = DelBitmap::load(&isdel_path(&dir))?;
        let wrt = WrtStore::open(&dir.join(WRT_STORE_FILE))?;
        let mut updatable = Vec::with_capacity(schema.updatable_colgroups.len());
        for &cg in &schema.updatable_colgroups {
            let cg_schema = &schema.colgroups[cg];
            let path = dir.join(format!("colgroup-{}.fixlen", cg_schema.name()));
            updatable.push(RwLock::new(FixedLenStore::open(&path)?));
        }
        if wrt.num_rows() != is_del.len() as u64 {
            return Err(CoreError::corruption(format!(
                "IsDel covers {} rows but the row store has {}: {}",
                is_del.len(),
                wrt.num_rows(),
                dir.display()
            )));
        }
        let indexes: Vec<MutableIndex> = schema
            .indexes
            .iter()
            .map(|ix| MutableIndex::new(ix.unique))
            .collect();

        let seg = Self {
            core: SegCore::new(dir, is_del),
            schema,
            wrt: RwLock::new(wrt),
            updatable,
            indexes,
        };
        seg.rebuild_indexes()?;
        Ok(seg)
    }

    fn rebuild_indexes(&self) -> CoreResult<()> {
        if self.indexes.is_empty() {
            return Ok(());
        }
        let mut ctx = TableCtx::new();
        let mut row = Vec::new();
        for sub in 0..self.num_rows() {
            if self.core.is_deleted(sub) || !self.row_present(sub) {
                continue;
            }
            row.clear();
            self.get_value_append(sub, &mut row, &mut ctx)?;
            self.schema.row.parse_row(&row, &mut ctx.cols1)?;
            for (i, index) in self.indexes.iter().enumerate() {
                ctx.key1.clear();
                self.schema.index_key_append(i, &ctx.cols1, &row, &mut ctx.key1);
                index.insert(&ctx.key1, sub as u32);
            }
        }
        Ok(())
    }

    /// The mutable index `i`.
    pub(crate) fn index(&self, i: usize) -> &MutableIndex {
        &self.indexes[i]
    }

    /// Whether the slot at `sub_id` still holds a record.
    pub(crate) fn row_present(&self, sub_id: u64) -> bool {
        let wrt = self.wrt.read();
        (sub_id as usize) < wrt.rows.len() && wrt.rows[sub_id as usize].is_some()
    }

    /// Appends a row, splitting it across the row store and the updatable
    /// colgroups. Returns the new sub-id.
    pub(crate) fn append(&self, row: &[u8], ctx: &mut TableCtx) -> CoreResult<u64> {
        if self.updatable.is_empty() {
            return self.wrt.write().append(row);
        }
        self.schema.row.parse_row(row, &mut ctx.cols1)?;
        ctx.buf1.clear();
        self.schema.wrt.select_parent_append(&ctx.cols1, row, &mut ctx.buf1);
        let sub = self.wrt.write().append(&ctx.buf1)?;
        for (pos, &cg) in self.schema.updatable_colgroups.iter().enumerate() {
            ctx.buf2.clear();
            self.schema.colgroups[cg].select_parent_append(&ctx.cols1, row, &mut ctx.buf2);
            let cell_id = self.updatable[pos].write().append(&ctx.buf2)?;
            if cell_id != sub {
                return Err(CoreError::logic(format!(
                    "updatable colgroup id {cell_id} diverged from row store id {sub}"
                )));
            }
        }
        Ok(sub)
    }

    /// Rewrites the row at `sub_id` (deleted-id reuse and tail replace).
    pub(crate) fn replace_at(&self, sub_id: u64, row: &[u8], ctx: &mut TableCtx) -> CoreResult<()> {
        if self.updatable.is_empty() {
            self.wrt.write().put_at(sub_id, row)?;
        } else {
            self.schema.row.parse_row(row, &mut ctx.cols1)?;
            ctx.buf1.clear();
            self.schema.wrt.select_parent_append(&ctx.cols1, row, &mut ctx.buf1);
            self.wrt.write().put_at(sub_id, &ctx.buf1)?;
            for (pos, &cg) in self.schema.updatable_colgroups.iter().enumerate() {
                ctx.buf2.clear();
                self.schema.colgroups[cg].select_parent_append(&ctx.cols1, row, &mut ctx.buf2);
                self.updatable[pos].write().write_cell(sub_id, &ctx.buf2)?;
            }
        }
        self.core.note_update(sub_id);
        Ok(())
    }

    /// Physically removes the row at `sub_id` from the row store.
    pub(crate) fn remove(&self, sub_id: u64) -> CoreResult<()> {
        self.wrt.write().remove(sub_id)
    }

    /// Rewrites one in-place-updatable cell; journals the update.
    pub(crate) fn update_cell(
        &self,
        colgroup_pos: usize,
        sub_id: u64,
        cell: &[u8],
    ) -> CoreResult<()> {
        self.updatable[colgroup_pos].write().write_cell(sub_id, cell)?;
        self.core.note_update(sub_id);
        Ok(())
    }

    /// Reads a cell of an updatable colgroup, by position in
    /// `schema.updatable_colgroups`.
    pub(crate) fn read_cell_append(
        &self,
        colgroup_pos: usize,
        sub_id: u64,
        out: &mut Vec<u8>,
    ) -> CoreResult<()> {
        self.updatable[colgroup_pos].read().get_value_append(sub_id, out)
    }

    /// Flushes the row store, bitmap, and updatable stores.
    pub fn flush(&self) -> CoreResult<()> {
        self.wrt.write().flush()?;
        for store in &self.updatable {
            store.read().flush()?;
        }
        self.core.sync.read().is_del.flush()?;
        Ok(())
    }

    fn combine_append(&self, sub_id: u64, out: &mut Vec<u8>, ctx: &mut TableCtx) -> CoreResult<()> {
        ctx.buf1.clear();
        ctx.cols1.clear();
        let present = self.wrt.read().get_append(sub_id, &mut ctx.buf1)?;
        if !present {
            return Err(CoreError::logic(format!(
                "read of physically removed row {sub_id}"
            )));
        }
        self.schema.wrt.parse_row_append(&ctx.buf1, 0, &mut ctx.cols1)?;
        for (pos, &cg) in self.schema.updatable_colgroups.iter().enumerate() {
            let start = ctx.buf1.len();
            self.updatable[pos].read().get_value_append(sub_id, &mut ctx.buf1)?;
            self.schema.colgroups[cg].parse_row_append(&ctx.buf1, start, &mut ctx.cols1)?;
        }

        ctx.cols2.resize(self.schema.row.column_num());
        for i in 0..self.schema.wrt.column_num() {
            let r = ctx.cols1.range(i);
            ctx.cols2.set(self.schema.wrt.parent_col(i), r.start, r.end);
        }
        let mut base = self.schema.wrt.column_num();
        for &cg in &self.schema.updatable_colgroups {
            let cg_schema = &self.schema.colgroups[cg];
            for j in 0..cg_schema.column_num() {
                let r = ctx.cols1.range(base + j);
                ctx.cols2.set(cg_schema.parent_col(j), r.start, r.end);
            }
            base += cg_schema.column_num();
        }
        self.schema.row.combine_row_append(&ctx.cols2, &ctx.buf1, out);
        Ok(())
    }
}

impl Segment for WritableSegment {
    fn core(&self) -> &SegCore {
        &self.core
    }

    fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    fn get_value_append(
        &self,
        sub_id: u64,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        if self.updatable.is_empty() {
            let present = self.wrt.read().get_append(sub_id, out)?;
            if !present {
                return Err(CoreError::logic(format!(
                    "read of physically removed row {sub_id}"
                )));
            }
            return Ok(());
        }
        self.combine_append(sub_id, out, ctx)
    }

    fn index_search_exact_append(
        &self,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        ctx.ids.clear();
        self.indexes[index_id].search_exact_append(key, &mut ctx.ids);
        let sync = self.core.sync.read();
        for &sub in &ctx.ids {
            if !sync.is_del.get(sub as usize) {
                out.push(sub);
            }
        }
        Ok(())
    }

    fn select_columns(
        &self,
        sub_id: u64,
        column_ids: &[usize],
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        // the combine already reflects the freshest in-place cells
        ctx.buf2.clear();
        let mut row = std::mem::take(&mut ctx.buf2);
        self.get_value_append(sub_id, &mut row, ctx)?;
        self.schema.row.parse_row(&row, &mut ctx.cols3)?;
        let last = column_ids.len() - 1;
        for (i, &col) in column_ids.iter().enumerate() {
            let data = ctx.cols3.col(&row, col);
            if self.schema.row.column(col).fixed_size().is_none() && i != last {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(data);
        }
        ctx.buf2 = row;
        Ok(())
    }

    fn select_one_column(
        &self,
        sub_id: u64,
        column_id: usize,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        let proj = self.schema.col_project[column_id];
        // an updatable cell can be read straight from its store
        if let Some(pos) = self
            .schema
            .updatable_colgroups
            .iter()
            .position(|&cg| cg == proj.colgroup)
        {
            return self.read_cell_append(pos, sub_id, out);
        }
        self.select_columns(sub_id, &[column_id], out, ctx)
    }

    fn data_storage_size(&self) -> u64 {
        let mut size = self.wrt.read().data_size();
        for store in &self.updatable {
            size += store.read().data_storage_size();
        }
        size
    }

    fn total_storage_size(&self) -> u64 {
        let mut size = self.data_storage_size();
        for index in &self.indexes {
            size += index.storage_size();
        }
        size += self.core.num_rows().div_ceil(8);
        size
    }

    fn as_writable(&self) -> Option<&WritableSegment> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType, IndexDef, Schema};
    use tempfile::tempdir;

    fn schema_with_updatable() -> Arc<TableSchema> {
        let row = Schema::new(
            "row",
            vec![
                ColumnMeta::new("a", ColumnType::Int32),
                ColumnMeta::new("b", ColumnType::VarBinary),
                ColumnMeta::new("c", ColumnType::Uint64).updatable(),
            ],
        )
        .unwrap();
        Arc::new(TableSchema::build(row, &[IndexDef::new(["a"])]).unwrap())
    }

    fn encode(a: i32, b: &[u8], c: u64) -> Vec<u8> {
        let mut row = Vec::new();
        row.extend_from_slice(&a.to_le_bytes());
        row.extend_from_slice(&(b.len() as u32).to_le_bytes());
        row.extend_from_slice(b);
        row.extend_from_slice(&c.to_le_bytes());
        row
    }

    #[test]
    fn append_and_combine_roundtrip() {
        let dir = tempdir().unwrap();
        let seg =
            WritableSegment::create(dir.path().join("wr-0000"), schema_with_updatable()).unwrap();
        let mut ctx = TableCtx::new();

        let row = encode(7, b"hello", 42);
        let sub = seg.append(&row, &mut ctx).unwrap();
        seg.core().push_row().unwrap();
        assert_eq!(sub, 0);

        let mut out = Vec::new();
        seg.get_value_append(0, &mut out, &mut ctx).unwrap();
        assert_eq!(out, row);
    }

    #[test]
    fn in_place_cell_update_shows_in_reads() {
        let dir = tempdir().unwrap();
        let seg =
            WritableSegment::create(dir.path().join("wr-0000"), schema_with_updatable()).unwrap();
        let mut ctx = TableCtx::new();

        seg.append(&encode(1, b"x", 10), &mut ctx).unwrap();
        seg.core().push_row().unwrap();
        seg.update_cell(0, 0, &99u64.to_le_bytes()).unwrap();

        let mut out = Vec::new();
        seg.get_value_append(0, &mut out, &mut ctx).unwrap();
        assert_eq!(out, encode(1, b"x", 99));

        out.clear();
        seg.select_one_column(0, 2, &mut out, &mut ctx).unwrap();
        assert_eq!(out, 99u64.to_le_bytes());
    }

    #[test]
    fn reopen_replays_log_and_rebuilds_indexes() {
        let dir = tempdir().unwrap();
        let seg_dir = dir.path().join("wr-0000");
        let schema = schema_with_updatable();
        {
            let seg = WritableSegment::create(seg_dir.clone(), schema.clone()).unwrap();
            let mut ctx = TableCtx::new();
            for i in 0..5i32 {
                seg.append(&encode(i, b"payload", i as u64), &mut ctx).unwrap();
                seg.core().push_row().unwrap();
            }
            seg.remove(2).unwrap();
            seg.core().set_del(2).unwrap();
            seg.flush().unwrap();
        }

        let seg = WritableSegment::open(seg_dir, schema).unwrap();
        let mut ctx = TableCtx::new();
        assert_eq!(seg.num_rows(), 5);
        assert!(!seg.row_present(2));

        let mut ids = Vec::new();
        seg.index_search_exact_append(0, &3i32.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![3]);

        // the removed and deleted row is neither present nor indexed
        ids.clear();
        seg.index_search_exact_append(0, &2i32.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn deleted_rows_filtered_from_search() {
        let dir = tempdir().unwrap();
        let seg =
            WritableSegment::create(dir.path().join("wr-0000"), schema_with_updatable()).unwrap();
        let mut ctx = TableCtx::new();

        seg.append(&encode(5, b"a", 1), &mut ctx).unwrap();
        seg.core().push_row().unwrap();
        seg.append(&encode(5, b"b", 2), &mut ctx).unwrap();
        seg.core().push_row().unwrap();
        seg.index(0).insert(&5i32.to_le_bytes(), 0);
        seg.index(0).insert(&5i32.to_le_bytes(), 1);
        seg.core().set_del(0).unwrap();

        let mut ids = Vec::new();
        seg.index_search_exact_append(0, &5i32.to_le_bytes(), &mut ids, &mut ctx)
            .unwrap();
        assert_eq!(ids, vec![1]);
    }
}
