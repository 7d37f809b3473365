//! Read-only segments: compressed columnar data with mutable deletion bits.
//!
//! Row data is immutable (one store per colgroup, the index stores doubling
//! as the stores of their colgroups) with two exceptions: `is_del` keeps
//! accepting deletion marks, and in-place-updatable colgroups remain
//! mmap-writable so cell updates and the convert/purge drains can land.
//!
//! A segment that was produced by convert while rows were already deleted
//! carries `is_purged`: stores hold only the surviving rows, and
//! `physical_id = is_purged.rank0(logical_id)` translates at the segment
//! boundary. Logical ids are what every caller sees; physical ids never
//! escape.

use crate::bitmap::{BitVec, DelBitmap, RankSelect0};
use crate::context::TableCtx;
use crate::error::{CoreError, CoreResult};
use crate::index::{open_index, IndexHandles, ReadableIndex};
use crate::schema::TableSchema;
use crate::segment::{isdel_path, SegCore, Segment, ISPURGED_FILE};
use crate::store::{open_store, FixedLenStore, MultiPartStore, ReadableStore};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratadb_storage::read_all;

/// One colgroup of a read-only segment.
pub(crate) enum Colgroup {
    /// Immutable store (includes the index stores).
    Plain(Arc<dyn ReadableStore>),
    /// In-place-updatable fixed-length cells, mmap-writable.
    Updatable(RwLock<FixedLenStore>),
}

impl Colgroup {
    pub(crate) fn get_value_append(&self, phys: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        match self {
            Colgroup::Plain(store) => store.get_value_append(phys, out),
            Colgroup::Updatable(store) => store.read().get_value_append(phys, out),
        }
    }

    fn data_storage_size(&self) -> u64 {
        match self {
            Colgroup::Plain(store) => store.data_storage_size(),
            Colgroup::Updatable(store) => store.read().data_storage_size(),
        }
    }

    pub(crate) fn data_inflate_size(&self) -> u64 {
        match self {
            Colgroup::Plain(store) => store.data_inflate_size(),
            Colgroup::Updatable(store) => store.read().data_inflate_size(),
        }
    }

    pub(crate) fn num_rows(&self) -> u64 {
        match self {
            Colgroup::Plain(store) => store.num_rows(),
            Colgroup::Updatable(store) => store.read().num_rows(),
        }
    }
}

/// A fully compressed segment.
pub struct ReadonlySegment {
    core: SegCore,
    schema: Arc<TableSchema>,
    is_purged: Option<RankSelect0>,
    indexes: Vec<Arc<dyn ReadableIndex>>,
    colgroups: Vec<Colgroup>,
}

impl ReadonlySegment {
    /// Assembles a freshly built segment (convert/purge output) before it
    /// is saved and reloaded.
    pub(crate) fn assemble(
        formal_dir: PathBuf,
        schema: Arc<TableSchema>,
        is_del: BitVec,
        is_purged: Option<RankSelect0>,
        indexes: Vec<IndexHandles>,
        colgroups: Vec<Colgroup>,
    ) -> Self {
        let core = SegCore::new(formal_dir, DelBitmap::from_bits(is_del));
        core.freeze();
        Self {
            core,
            schema,
            is_purged,
            indexes: indexes.into_iter().map(|h| h.index).collect(),
            colgroups,
        }
    }

    /// Loads a segment whose files live in `files_dir`. `formal_dir` is the
    /// directory the segment answers to (and will delete on drop); during a
    /// convert/purge the files are still in the `.tmp` sibling.
    pub fn load(
        files_dir: &Path,
        formal_dir: PathBuf,
        schema: Arc<TableSchema>,
    ) -> CoreResult<Self> {
        let mut is_del = DelBitmap::load(&isdel_path(files_dir))?;
        let is_purged = Self::load_is_purged(files_dir, &mut is_del)?;

        let mut indexes = Vec::with_capacity(schema.index_num());
        let mut colgroups: Vec<Colgroup> = Vec::with_capacity(schema.colgroup_num());
        for ix in &schema.indexes {
            let handles = open_index(
                files_dir,
                &format!("index-{}", ix.schema.name()),
                ix.unique,
            )?;
            colgroups.push(Colgroup::Plain(handles.store.clone()));
            indexes.push(handles.index);
        }
        for cg in schema.index_num()..schema.colgroup_num() {
            let name = schema.colgroups[cg].name();
            if schema.updatable_colgroups.contains(&cg) {
                let path = files_dir.join(format!("colgroup-{name}.fixlen"));
                colgroups.push(Colgroup::Updatable(RwLock::new(FixedLenStore::open(&path)?)));
            } else {
                colgroups.push(Colgroup::Plain(Self::open_colgroup(files_dir, name)?));
            }
        }

        let core = SegCore::new(formal_dir, is_del);
        core.freeze();
        Ok(Self {
            core,
            schema,
            is_purged,
            indexes,
            colgroups,
        })
    }

    fn load_is_purged(dir: &Path, is_del: &mut DelBitmap) -> CoreResult<Option<RankSelect0>> {
        let path = dir.join(ISPURGED_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = read_all(&path)?;
        if data.len() < 8 {
            return Err(CoreError::corruption(format!(
                "IsPurged file too short: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(data[..8].try_into().unwrap()) as usize;
        let bits = BitVec::from_bytes(&data[8..], rows)?;
        if bits.len() != is_del.len() {
            // an interrupted IsDel rewrite left a stale bitmap; fall back to
            // the backup written before the rewrite
            let backup = dir.join("IsDel.backup");
            if backup.exists() {
                tracing::warn!(dir = %dir.display(), "restoring IsDel from backup");
                std::fs::rename(&backup, isdel_path(dir))?;
                *is_del = DelBitmap::load(&isdel_path(dir))?;
            }
            if bits.len() != is_del.len() {
                return Err(CoreError::corruption(format!(
                    "IsPurged covers {} rows but IsDel covers {}: {}",
                    bits.len(),
                    is_del.len(),
                    dir.display()
                )));
            }
        }
        Ok(Some(RankSelect0::new(bits)))
    }

    fn open_colgroup(dir: &Path, name: &str) -> CoreResult<Arc<dyn ReadableStore>> {
        let prefix = format!("colgroup-{name}.");
        let mut files: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|f| f.starts_with(&prefix))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(CoreError::corruption(format!(
                "missing colgroup file: {}",
                dir.join(&prefix).display()
            )));
        }
        let first_tail = &files[0][prefix.len()..];
        let is_sharded = first_tail.len() > 5
            && first_tail.as_bytes()[4] == b'.'
            && first_tail[..4].bytes().all(|b| b.is_ascii_digit());
        if !is_sharded {
            if files.len() != 1 {
                return Err(CoreError::corruption(format!(
                    "ambiguous colgroup files for {prefix} in {}",
                    dir.display()
                )));
            }
            return open_store(dir, &files[0]);
        }
        let mut parts = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            let tail = &file[prefix.len()..];
            let part_idx: usize = tail[..4]
                .parse()
                .map_err(|_| CoreError::corruption(format!("bad shard name: {file}")))?;
            if part_idx != i {
                return Err(CoreError::corruption(format!(
                    "missing shard {i} of colgroup {name} in {}",
                    dir.display()
                )));
            }
            parts.push(open_store(dir, file)?);
        }
        Ok(Arc::new(MultiPartStore::new(parts)))
    }

    /// Writes every piece into `dir`. Stores already backed by a file in
    /// `dir` are flushed, not rewritten.
    pub fn save(&self, dir: &Path) -> CoreResult<()> {
        if self.core.is_to_be_del() {
            return Ok(());
        }
        if let Some(purged) = &self.is_purged {
            let bits = purged.bits();
            let mut data = Vec::with_capacity(8 + bits.len().div_ceil(8));
            data.extend_from_slice(&(bits.len() as u64).to_le_bytes());
            data.extend_from_slice(&bits.to_bytes());
            stratadb_storage::atomic_write(dir.join(ISPURGED_FILE), &data)?;
        }
        for (i, index) in self.indexes.iter().enumerate() {
            let name = self.schema.indexes[i].schema.name();
            index.save(&dir.join(format!("index-{name}.{}", index.file_ext())))?;
        }
        for cg in self.schema.index_num()..self.schema.colgroup_num() {
            let name = self.schema.colgroups[cg].name();
            match &self.colgroups[cg] {
                Colgroup::Updatable(store) => {
                    store
                        .read()
                        .save(&dir.join(format!("colgroup-{name}.fixlen")))?;
                }
                Colgroup::Plain(store) => match store.as_multipart() {
                    Some(multi) => multi.save_parts(dir, &format!("colgroup-{name}"))?,
                    None => {
                        store.save(&dir.join(format!("colgroup-{name}.{}", store.file_ext())))?
                    }
                },
            }
        }
        self.core.sync.read().is_del.save(&isdel_path(dir))?;
        Ok(())
    }

    /// Translates a logical id to the dense store id.
    #[must_use]
    pub fn physical_id(&self, logic_id: u64) -> u64 {
        match &self.is_purged {
            Some(purged) => purged.rank0(logic_id as usize) as u64,
            None => logic_id,
        }
    }

    /// Translates a dense store id back to the logical id.
    #[must_use]
    pub fn logical_id(&self, phys_id: u64) -> u64 {
        match &self.is_purged {
            Some(purged) => purged.select0(phys_id as usize) as u64,
            None => phys_id,
        }
    }

    /// Rows physically present in the stores.
    #[must_use]
    pub fn physical_rows(&self) -> u64 {
        match &self.is_purged {
            Some(purged) => purged.max_rank0() as u64,
            None => self.core.num_rows(),
        }
    }

    /// Whether this segment carries purge bits.
    #[must_use]
    pub fn has_purge_bits(&self) -> bool {
        self.is_purged.is_some()
    }

    /// Whether `logic_id` was purged out of the stores.
    #[must_use]
    pub fn is_purged_at(&self, logic_id: u64) -> bool {
        self.is_purged
            .as_ref()
            .is_some_and(|purged| purged.get(logic_id as usize))
    }

    fn get_value_by_physical(
        &self,
        phys: u64,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        ctx.buf1.clear();
        ctx.cols1.clear();
        for (cg, colgroup) in self.colgroups.iter().enumerate() {
            let start = ctx.buf1.len();
            colgroup.get_value_append(phys, &mut ctx.buf1)?;
            self.schema.colgroups[cg].parse_row_append(&ctx.buf1, start, &mut ctx.cols1)?;
        }

        ctx.cols2.resize(self.schema.row.column_num());
        let mut base = 0;
        for cg in 0..self.schema.colgroup_num() {
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

    /// Store of colgroup `cg`.
    pub(crate) fn colgroup(&self, cg: usize) -> &Colgroup {
        &self.colgroups[cg]
    }

    pub(crate) fn write_updatable_cell(
        &self,
        colgroup_pos: usize,
        phys: u64,
        cell: &[u8],
    ) -> CoreResult<()> {
        let cg = self.schema.updatable_colgroups[colgroup_pos];
        match &self.colgroups[cg] {
            Colgroup::Updatable(store) => store.write().write_cell(phys, cell),
            Colgroup::Plain(_) => Err(CoreError::logic("updatable colgroup loaded as plain")),
        }
    }

    pub(crate) fn read_updatable_cell(
        &self,
        colgroup_pos: usize,
        phys: u64,
        out: &mut Vec<u8>,
    ) -> CoreResult<()> {
        let cg = self.schema.updatable_colgroups[colgroup_pos];
        self.colgroups[cg].get_value_append(phys, out)
    }

    /// Rewrites one in-place-updatable cell by logical id; journals it.
    pub(crate) fn update_cell(
        &self,
        colgroup_pos: usize,
        logic_id: u64,
        cell: &[u8],
    ) -> CoreResult<()> {
        self.write_updatable_cell(colgroup_pos, self.physical_id(logic_id), cell)?;
        self.core.note_update(logic_id);
        Ok(())
    }
}

impl Segment for ReadonlySegment {
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
        let rows = self.core.num_rows();
        if sub_id >= rows {
            return Err(CoreError::OutOfRange { id: sub_id, rows });
        }
        self.get_value_by_physical(self.physical_id(sub_id), out, ctx)
    }

    fn index_search_exact_append(
        &self,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        ctx.ids.clear();
        self.indexes[index_id].search_exact_append(key, &mut ctx.ids)?;
        let sync = self.core.sync.read();
        for &phys in &ctx.ids {
            let logic = self.logical_id(phys);
            if !sync.is_del.get(logic as usize) {
                out.push(logic);
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
        let phys = self.physical_id(sub_id);
        ctx.buf1.clear();
        ctx.cols1.clear();
        // colgroups fetched so far: (colgroup id, base offset in cols1)
        let mut fetched: Vec<(usize, usize)> = Vec::new();
        let last = column_ids.len() - 1;
        for (i, &col) in column_ids.iter().enumerate() {
            let proj = self.schema.col_project[col];
            let base = match fetched.iter().find(|f| f.0 == proj.colgroup) {
                Some(&(_, base)) => base,
                None => {
                    let base = ctx.cols1.len();
                    let start = ctx.buf1.len();
                    self.colgroups[proj.colgroup].get_value_append(phys, &mut ctx.buf1)?;
                    self.schema.colgroups[proj.colgroup].parse_row_append(
                        &ctx.buf1,
                        start,
                        &mut ctx.cols1,
                    )?;
                    fetched.push((proj.colgroup, base));
                    base
                }
            };
            let data = ctx.cols1.col(&ctx.buf1, base + proj.sub);
            if self.schema.row.column(col).fixed_size().is_none() && i != last {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(data);
        }
        Ok(())
    }

    fn select_one_column(
        &self,
        sub_id: u64,
        column_id: usize,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()> {
        let phys = self.physical_id(sub_id);
        let proj = self.schema.col_project[column_id];
        let cg_schema = &self.schema.colgroups[proj.colgroup];
        if cg_schema.column_num() == 1 {
            return self.colgroups[proj.colgroup].get_value_append(phys, out);
        }
        ctx.buf1.clear();
        ctx.cols1.clear();
        self.colgroups[proj.colgroup].get_value_append(phys, &mut ctx.buf1)?;
        cg_schema.parse_row_append(&ctx.buf1, 0, &mut ctx.cols1)?;
        out.extend_from_slice(ctx.cols1.col(&ctx.buf1, proj.sub));
        Ok(())
    }

    fn data_storage_size(&self) -> u64 {
        self.colgroups.iter().map(Colgroup::data_storage_size).sum()
    }

    fn total_storage_size(&self) -> u64 {
        let bitmap_bytes = self.core.num_rows().div_ceil(8)
            + self
                .is_purged
                .as_ref()
                .map_or(0, |p| p.bits().len().div_ceil(8) as u64);
        self.data_storage_size() + bitmap_bytes
    }

    fn as_readonly(&self) -> Option<&ReadonlySegment> {
        Some(self)
    }
}
