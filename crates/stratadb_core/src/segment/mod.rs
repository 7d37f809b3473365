//! Segments: the units of the table's row space.
//!
//! Every segment owns a directory, a deletion bitmap, and a lifecycle:
//! the writable tail freezes when a successor is installed, a frozen
//! segment is converted into a compressed read-only one, and a read-only
//! segment can be purged into a denser replacement. A segment flagged
//! `to_be_del` removes its directory when the last shared owner drops.
//!
//! [`SegCore`] carries the state common to both kinds: the `is_del` bitmap
//! with its cached popcount, the pending-update journal used by the
//! convert/purge triple drain, and the lifecycle flags. The bitmap and
//! journal share one short RwLock, taken on tight read paths where the
//! table lock would be overkill.

mod convert;
mod readonly;
mod writable;

pub(crate) use convert::{convert_segment, purge_segment};
pub use readonly::ReadonlySegment;
pub use writable::WritableSegment;

use crate::bitmap::{BitVec, DelBitmap};
use crate::context::TableCtx;
use crate::error::CoreResult;
use crate::schema::TableSchema;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File name of the deletion bitmap inside a segment directory.
pub(crate) const ISDEL_FILE: &str = "IsDel";
/// File name of the purge bitmap inside a read-only segment directory.
pub(crate) const ISPURGED_FILE: &str = "IsPurged.rs";

/// Pending-update journal of a segment under conversion or purge.
///
/// Rare updates keep a dense little id list; once the list crosses
/// rows/256 it is promoted to a bitmap.
#[derive(Debug)]
pub enum Updates {
    /// Sorted-later id list for sparse updates.
    Sparse(Vec<u32>),
    /// One bit per logical row.
    Dense(BitVec),
}

impl Updates {
    fn note(&mut self, logic_id: u32, rows: usize) {
        match self {
            Updates::Sparse(list) => {
                let cap = (rows / 256).max(16);
                if list.len() < cap {
                    list.push(logic_id);
                    return;
                }
                let mut bits = BitVec::with_len(rows, false);
                for &id in list.iter() {
                    bits.set1(id as usize);
                }
                bits.set1(logic_id as usize);
                *self = Updates::Dense(bits);
            }
            Updates::Dense(bits) => {
                bits.set1(logic_id as usize);
            }
        }
    }

    /// Returns true when nothing has been journaled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Updates::Sparse(list) => list.is_empty(),
            Updates::Dense(bits) => bits.popcnt() == 0,
        }
    }

    /// Sorted, deduplicated logical ids in the journal.
    #[must_use]
    pub fn into_sorted_ids(self) -> Vec<u32> {
        match self {
            Updates::Sparse(mut list) => {
                list.sort_unstable();
                list.dedup();
                list
            }
            Updates::Dense(bits) => {
                (0..bits.len() as u32).filter(|&i| bits.get(i as usize)).collect()
            }
        }
    }
}

/// Deletion state guarded by the per-segment lock.
#[derive(Debug)]
pub(crate) struct SegSync {
    pub(crate) is_del: DelBitmap,
    pub(crate) del_cnt: usize,
    pub(crate) updates: Updates,
}

/// State shared by writable and read-only segments.
#[derive(Debug)]
pub struct SegCore {
    dir: RwLock<PathBuf>,
    frozen: AtomicBool,
    dirty: AtomicBool,
    to_be_del: AtomicBool,
    book_updates: AtomicBool,
    pub(crate) sync: RwLock<SegSync>,
}

impl SegCore {
    pub(crate) fn new(dir: PathBuf, is_del: DelBitmap) -> Self {
        let del_cnt = is_del.popcnt();
        Self {
            dir: RwLock::new(dir),
            frozen: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            to_be_del: AtomicBool::new(false),
            book_updates: AtomicBool::new(false),
            sync: RwLock::new(SegSync {
                is_del,
                del_cnt,
                updates: Updates::Sparse(Vec::new()),
            }),
        }
    }

    /// Directory currently backing this segment.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    pub(crate) fn set_dir(&self, dir: PathBuf) {
        *self.dir.write() = dir;
    }

    /// Logical rows covered by `is_del`.
    #[must_use]
    pub fn num_rows(&self) -> u64 {
        self.sync.read().is_del.len() as u64
    }

    /// Cached count of deleted rows.
    #[must_use]
    pub fn del_cnt(&self) -> usize {
        self.sync.read().del_cnt
    }

    /// Returns the deletion bit of `sub_id`.
    #[must_use]
    pub fn is_deleted(&self, sub_id: u64) -> bool {
        self.sync.read().is_del.get(sub_id as usize)
    }

    /// Snapshot of the deletion bits.
    #[must_use]
    pub fn snapshot_bits(&self) -> BitVec {
        self.sync.read().is_del.bits().clone()
    }

    /// Marks `sub_id` deleted; journals when updates are booked.
    pub fn set_del(&self, sub_id: u64) -> CoreResult<bool> {
        let mut sync = self.sync.write();
        let changed = sync.is_del.set1(sub_id as usize)?;
        if changed {
            sync.del_cnt += 1;
            self.dirty.store(true, Ordering::Release);
            if self.book_updates.load(Ordering::Acquire) {
                let rows = sync.is_del.len();
                sync.updates.note(sub_id as u32, rows);
            }
        }
        Ok(changed)
    }

    /// Clears the deletion bit of `sub_id` (deleted-id reuse on the tail).
    pub fn clear_del(&self, sub_id: u64) -> CoreResult<bool> {
        let mut sync = self.sync.write();
        let changed = sync.is_del.set0(sub_id as usize)?;
        if changed {
            sync.del_cnt -= 1;
            self.dirty.store(true, Ordering::Release);
            if self.book_updates.load(Ordering::Acquire) {
                let rows = sync.is_del.len();
                sync.updates.note(sub_id as u32, rows);
            }
        }
        Ok(changed)
    }

    /// Appends an undeleted row slot.
    pub fn push_row(&self) -> CoreResult<()> {
        self.sync.write().is_del.push(false)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Journals an in-place cell update of `sub_id`.
    pub fn note_update(&self, sub_id: u64) {
        if !self.book_updates.load(Ordering::Acquire) {
            return;
        }
        let mut sync = self.sync.write();
        let rows = sync.is_del.len();
        sync.updates.note(sub_id as u32, rows);
    }

    /// Starts journaling mutations for a convert/purge drain.
    pub fn enable_book_updates(&self) {
        self.book_updates.store(true, Ordering::Release);
    }

    /// Stops journaling (an abandoned convert/purge).
    pub fn disable_book_updates(&self) {
        self.book_updates.store(false, Ordering::Release);
        let _ = self.drain_updates();
    }

    /// Takes the journal, leaving it empty.
    pub fn drain_updates(&self) -> Updates {
        std::mem::replace(&mut self.sync.write().updates, Updates::Sparse(Vec::new()))
    }

    /// Whether this segment no longer accepts appends.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freezes the segment. Freezing is monotone.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Schedules the directory for removal on last drop.
    pub fn mark_to_be_del(&self) {
        self.to_be_del.store(true, Ordering::Release);
    }

    /// Whether the directory is scheduled for removal.
    #[must_use]
    pub fn is_to_be_del(&self) -> bool {
        self.to_be_del.load(Ordering::Acquire)
    }
}

impl Drop for SegCore {
    fn drop(&mut self) {
        if !self.to_be_del.load(Ordering::Acquire) {
            return;
        }
        let dir = self.dir.read().clone();
        tracing::info!(dir = %dir.display(), "removing segment directory");
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            tracing::error!(dir = %dir.display(), %err, "failed to remove segment directory");
        }
    }
}

/// Common interface of writable and read-only segments.
pub trait Segment: Send + Sync {
    /// Shared lifecycle and deletion state.
    fn core(&self) -> &SegCore;

    /// The table schema this segment was built under.
    fn schema(&self) -> &Arc<TableSchema>;

    /// Logical rows in the segment (including deleted ones).
    fn num_rows(&self) -> u64 {
        self.core().num_rows()
    }

    /// Appends the row at `sub_id` (logical, segment-local) to `out`.
    fn get_value_append(&self, sub_id: u64, out: &mut Vec<u8>, ctx: &mut TableCtx)
        -> CoreResult<()>;

    /// Appends the live segment-local ids matching `key` on index
    /// `index_id`, already filtered by `is_del` and translated to logical
    /// ids.
    fn index_search_exact_append(
        &self,
        index_id: usize,
        key: &[u8],
        out: &mut Vec<u64>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()>;

    /// Appends the projection of `column_ids` for row `sub_id` to `out`,
    /// encoded per the row schema's column encodings.
    fn select_columns(
        &self,
        sub_id: u64,
        column_ids: &[usize],
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()>;

    /// Appends the single column `column_id` of row `sub_id` to `out`.
    fn select_one_column(
        &self,
        sub_id: u64,
        column_id: usize,
        out: &mut Vec<u8>,
        ctx: &mut TableCtx,
    ) -> CoreResult<()>;

    /// Bytes of row data.
    fn data_storage_size(&self) -> u64;

    /// Bytes of row data plus indexes and bitmaps.
    fn total_storage_size(&self) -> u64;

    /// Downcast to the writable shape.
    fn as_writable(&self) -> Option<&WritableSegment> {
        None
    }

    /// Downcast to the read-only shape.
    fn as_readonly(&self) -> Option<&ReadonlySegment> {
        None
    }
}

/// Formats a segment directory name (`wr-0003`, `rd-0000`).
pub(crate) fn seg_dir_name(kind: &str, idx: usize) -> String {
    format!("{kind}-{idx:04}")
}

/// Path of the `IsDel` file inside `dir`.
pub(crate) fn isdel_path(dir: &Path) -> PathBuf {
    dir.join(ISDEL_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn updates_promote_to_dense() {
        let rows = 256 * 64;
        let mut updates = Updates::Sparse(Vec::new());
        for i in 0..(rows / 256) as u32 {
            updates.note(i, rows);
            assert!(matches!(updates, Updates::Sparse(_)));
        }
        updates.note(9999, rows);
        assert!(matches!(updates, Updates::Dense(_)));

        let ids = updates.into_sorted_ids();
        assert_eq!(ids.len(), rows / 256 + 1);
        assert!(ids.contains(&9999));
    }

    #[test]
    fn sparse_ids_sorted_and_deduped() {
        let mut updates = Updates::Sparse(Vec::new());
        for id in [9u32, 3, 9, 1] {
            updates.note(id, 100);
        }
        assert_eq!(updates.into_sorted_ids(), vec![1, 3, 9]);
    }

    #[test]
    fn core_tracks_del_cnt_and_journal() {
        let dir = tempdir().unwrap();
        let core = SegCore::new(dir.path().join("seg"), DelBitmap::new());
        for _ in 0..10 {
            core.push_row().unwrap();
        }
        assert_eq!(core.num_rows(), 10);

        assert!(core.set_del(3).unwrap());
        assert!(!core.set_del(3).unwrap());
        assert_eq!(core.del_cnt(), 1);
        assert!(core.drain_updates().is_empty());

        core.enable_book_updates();
        core.set_del(7).unwrap();
        core.note_update(2);
        let ids = core.drain_updates().into_sorted_ids();
        assert_eq!(ids, vec![2, 7]);
        assert!(core.drain_updates().is_empty());
    }

    #[test]
    fn to_be_del_removes_directory_on_drop() {
        let dir = tempdir().unwrap();
        let seg_dir = dir.path().join("wr-0000");
        std::fs::create_dir_all(&seg_dir).unwrap();
        std::fs::write(seg_dir.join("f"), b"x").unwrap();

        let core = SegCore::new(seg_dir.clone(), DelBitmap::new());
        core.mark_to_be_del();
        drop(core);
        assert!(!seg_dir.exists());
    }
}
