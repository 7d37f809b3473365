//! Key → row-id indexes.
//!
//! Read-only segments carry immutable [`ReadableIndex`] implementations
//! built from a sorted key batch; the index store doubles as the colgroup
//! store for its columns (record `i` is the key of physical row `i`).
//! Writable segments maintain a [`MutableIndex`] per index instead.
//!
//! Index files are `index-<name>.<ext>`: `.zint` for single-integer keys,
//! `.skey` for everything else, `.empty` for an index whose rows were all
//! purged.

mod mutable;
mod sorted;

pub use mutable::MutableIndex;
pub use sorted::SortedKeyIndex;

use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use crate::store::{EmptyStore, ReadableStore, SortableStrVec};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Read path of an immutable index.
pub trait ReadableIndex: Send + Sync {
    /// Appends the physical row ids holding exactly `key` to `out`.
    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> CoreResult<()>;

    /// Whether the schema declares this key unique.
    fn is_unique(&self) -> bool;

    /// Bytes the index occupies.
    fn index_storage_size(&self) -> u64;

    /// Creates a forward (ascending key) iterator.
    fn create_iter_forward(&self) -> Box<dyn IndexIter + '_>;

    /// Creates a backward (descending key) iterator.
    fn create_iter_backward(&self) -> Box<dyn IndexIter + '_>;

    /// Writes the index to `path` (extension included).
    fn save(&self, path: &Path) -> CoreResult<()>;

    /// File extension of this index kind, without the dot.
    fn file_ext(&self) -> &'static str;
}

/// Cursor over an index, yielding `(id, key)` pairs in key order.
pub trait IndexIter {
    /// Positions at the first entry whose key is `>= key` (forward) or
    /// `<= key` (backward). Returns the comparison of the found key against
    /// the target and the entry's id, or `None` when no such entry exists.
    fn seek_lower_bound(&mut self, key: &[u8]) -> Option<(Ordering, u64)>;

    /// Advances to the next entry, writing its id and key. Returns false at
    /// the end.
    fn increment(&mut self, id: &mut u64, key: &mut Vec<u8>) -> bool;

    /// Whether the underlying index is declared unique; used to shortcut
    /// duplicate-key scans.
    fn is_unique_in_schema(&self) -> bool;
}

/// The paired handles a read-only segment keeps per index: the index view
/// and the same object as the colgroup store.
#[derive(Clone)]
pub struct IndexHandles {
    /// The index view.
    pub index: Arc<dyn ReadableIndex>,
    /// The store view (record `i` = key of physical row `i`).
    pub store: Arc<dyn ReadableStore>,
}

/// An index over zero rows.
#[derive(Debug, Default)]
pub struct EmptyIndexStore;

impl ReadableIndex for EmptyIndexStore {
    fn search_exact_append(&self, _key: &[u8], _out: &mut Vec<u64>) -> CoreResult<()> {
        Ok(())
    }

    fn is_unique(&self) -> bool {
        false
    }

    fn index_storage_size(&self) -> u64 {
        0
    }

    fn create_iter_forward(&self) -> Box<dyn IndexIter + '_> {
        Box::new(EmptyIter)
    }

    fn create_iter_backward(&self) -> Box<dyn IndexIter + '_> {
        Box::new(EmptyIter)
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        stratadb_storage::atomic_write(path, b"SDEMPTY\0")?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "empty"
    }
}

struct EmptyIter;

impl IndexIter for EmptyIter {
    fn seek_lower_bound(&mut self, _key: &[u8]) -> Option<(Ordering, u64)> {
        None
    }

    fn increment(&mut self, _id: &mut u64, _key: &mut Vec<u8>) -> bool {
        false
    }

    fn is_unique_in_schema(&self) -> bool {
        false
    }
}

/// Builds the immutable index for one segment from the key of every live
/// physical row, in physical-id order.
pub fn build_index(
    schema: &Schema,
    unique: bool,
    data: &SortableStrVec,
) -> CoreResult<IndexHandles> {
    if data.is_empty() {
        let empty = Arc::new(EmptyIndexStore);
        return Ok(IndexHandles {
            index: empty,
            store: Arc::new(EmptyStore::new()),
        });
    }
    let index = Arc::new(SortedKeyIndex::build(schema, unique, data)?);
    Ok(IndexHandles {
        index: index.clone(),
        store: index,
    })
}

/// Opens an index by probing the known extensions for `index-<name>`.
pub fn open_index(dir: &Path, base: &str, unique: bool) -> CoreResult<IndexHandles> {
    for ext in ["zint", "skey"] {
        let path = dir.join(format!("{base}.{ext}"));
        if path.exists() {
            let index = Arc::new(SortedKeyIndex::load(&path, unique)?);
            return Ok(IndexHandles {
                index: index.clone(),
                store: index,
            });
        }
    }
    let empty_path = dir.join(format!("{base}.empty"));
    if empty_path.exists() {
        return Ok(IndexHandles {
            index: Arc::new(EmptyIndexStore),
            store: Arc::new(EmptyStore::new()),
        });
    }
    Err(CoreError::corruption(format!(
        "missing index file: {}",
        dir.join(base).display()
    )))
}
