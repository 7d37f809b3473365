//! Column-group stores.
//!
//! A store holds the records of one colgroup, addressed by **physical id**.
//! Writable segments use [`FixedLenStore`] in its growable form for
//! in-place-updatable colgroups; convert/purge build one of the immutable
//! forms per colgroup:
//!
//! | store                  | extension  | picked when |
//! |------------------------|------------|-------------|
//! | [`FixedLenStore`]      | `.fixlen`  | fixed-width colgroup |
//! | [`ZipIntStore`]        | `.zint`    | single integer column |
//! | [`CompressedBlobStore`]| `.zblob`   | general variable-width chunk |
//! | [`DictZipStore`]       | `.dictzip` | long records, shared dictionary |
//! | [`PlainBlobStore`]     | `.blob`    | temp files, linear-scan data |
//! | [`EmptyStore`]         | `.empty`   | colgroup with no live rows |
//!
//! [`MultiPartStore`] concatenates several of the above when one colgroup was
//! built in more than one compression chunk.

mod blob;
mod dictzip;
mod fixed;
mod multipart;
mod sortvec;
mod zblob;
mod zipint;

pub use blob::PlainBlobStore;
pub use dictzip::DictZipStore;
pub use fixed::FixedLenStore;
pub use multipart::MultiPartStore;
pub use sortvec::SortableStrVec;
pub use zblob::CompressedBlobStore;
pub use zipint::ZipIntStore;

pub(crate) use zipint::{decode_int, encode_int, int_byte_len};

use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use std::path::Path;
use std::sync::Arc;

/// Read path of a column-group store.
pub trait ReadableStore: Send + Sync {
    /// Number of records.
    fn num_rows(&self) -> u64;

    /// Bytes the store occupies (compressed form).
    fn data_storage_size(&self) -> u64;

    /// Bytes of the records before compression.
    fn data_inflate_size(&self) -> u64 {
        self.data_storage_size()
    }

    /// Appends record `id` to `out`.
    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()>;

    /// Replaces `out` with record `id`.
    fn get_value(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        out.clear();
        self.get_value_append(id, out)
    }

    /// Writes the store to `path` (extension included).
    fn save(&self, path: &Path) -> CoreResult<()>;

    /// File extension of this store kind, without the dot.
    fn file_ext(&self) -> &'static str;

    /// Downcast for multipart-aware walkers.
    fn as_multipart(&self) -> Option<&MultiPartStore> {
        None
    }

    /// Downcast for in-place cell access.
    fn as_fixed(&self) -> Option<&FixedLenStore> {
        None
    }
}

/// Bounds check shared by the store implementations.
pub(crate) fn check_row(id: u64, rows: u64) -> CoreResult<()> {
    if id < rows {
        Ok(())
    } else {
        Err(CoreError::OutOfRange { id, rows })
    }
}

/// A store with no records. Stands in for colgroups whose rows were all
/// purged.
#[derive(Debug, Default)]
pub struct EmptyStore;

impl EmptyStore {
    /// Creates the empty store.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Loads the marker file (content is ignored).
    pub fn load(_path: &Path) -> CoreResult<Self> {
        Ok(Self)
    }
}

impl ReadableStore for EmptyStore {
    fn num_rows(&self) -> u64 {
        0
    }

    fn data_storage_size(&self) -> u64 {
        0
    }

    fn get_value_append(&self, id: u64, _out: &mut Vec<u8>) -> CoreResult<()> {
        Err(CoreError::OutOfRange { id, rows: 0 })
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        stratadb_storage::atomic_write(path, b"SDEMPTY\0")?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "empty"
    }
}

/// Builds the immutable store for one compression chunk.
///
/// A single integer column packs as zipped ints; everything else goes to the
/// zstd block store.
pub fn build_store(schema: &Schema, data: &SortableStrVec) -> CoreResult<Arc<dyn ReadableStore>> {
    if schema.column_num() == 1 && schema.column(0).ty.is_integer() {
        match ZipIntStore::build(schema.column(0).ty, data) {
            Ok(store) => return Ok(Arc::new(store)),
            Err(err) => {
                tracing::debug!(schema = schema.name(), %err, "zip-int build fell back to blocks");
            }
        }
    }
    Ok(Arc::new(CompressedBlobStore::build(data)?))
}

/// Opens a store file by its extension.
pub fn open_store(dir: &Path, file_name: &str) -> CoreResult<Arc<dyn ReadableStore>> {
    let path = dir.join(file_name);
    let ext = file_name.rsplit('.').next().unwrap_or("");
    Ok(match ext {
        "fixlen" => Arc::new(FixedLenStore::load(&path)?),
        "blob" => Arc::new(PlainBlobStore::load(&path)?),
        "zint" => Arc::new(ZipIntStore::load(&path)?),
        "zblob" => Arc::new(CompressedBlobStore::load(&path)?),
        "dictzip" => Arc::new(DictZipStore::load(&path)?),
        "empty" => Arc::new(EmptyStore::load(&path)?),
        other => {
            return Err(CoreError::corruption(format!(
                "unknown store extension {other:?}: {}",
                path.display()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_rejects_reads() {
        let store = EmptyStore::new();
        let mut out = Vec::new();
        assert!(matches!(
            store.get_value_append(0, &mut out),
            Err(CoreError::OutOfRange { .. })
        ));
    }
}
