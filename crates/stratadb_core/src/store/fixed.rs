//! Fixed-length cell store.
//!
//! Cells are `fixed_len` bytes each, addressed by physical id. The store is
//! mmap-backed in both of its lives: growable read-write for the updatable
//! colgroups of a writable segment (cells are rewritten in place), read-only
//! once a segment has been converted.
//!
//! File layout: 8-byte magic, `fixed_len` u32, reserved u32, row count u64,
//! then the cells. The file grows in chunks so appends rarely remap.

use crate::error::{CoreError, CoreResult};
use crate::store::{check_row, ReadableStore};
use std::path::Path;
use stratadb_storage::{atomic_write, MmapFile, MmapFileMut};

const MAGIC: &[u8; 8] = b"SDFIXLEN";
const HEADER: u64 = 24;
const GROW_CHUNK: u64 = 64 * 1024;

enum Backing {
    Mut(MmapFileMut),
    Ro(MmapFile),
}

/// Store of fixed-width records.
pub struct FixedLenStore {
    fixed_len: u32,
    rows: u64,
    backing: Backing,
}

impl FixedLenStore {
    /// Creates a new store file at `path` for cells of `fixed_len` bytes.
    pub fn create(path: &Path, fixed_len: usize) -> CoreResult<Self> {
        if fixed_len == 0 {
            return Err(CoreError::invalid_argument(
                "fixed-length store needs a nonzero cell width",
            ));
        }
        let mut map = MmapFileMut::create(path, GROW_CHUNK)?;
        map.write_at(0, MAGIC)?;
        map.write_at(8, &(fixed_len as u32).to_le_bytes())?;
        map.write_at(12, &0u32.to_le_bytes())?;
        map.write_at(16, &0u64.to_le_bytes())?;
        Ok(Self {
            fixed_len: fixed_len as u32,
            rows: 0,
            backing: Backing::Mut(map),
        })
    }

    /// Opens an existing store read-write.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let map = MmapFileMut::open(path)?;
        let (fixed_len, rows) = Self::parse_header(map.as_slice(), path)?;
        Ok(Self {
            fixed_len,
            rows,
            backing: Backing::Mut(map),
        })
    }

    /// Opens an existing store read-only.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let map = MmapFile::open(path)?;
        let (fixed_len, rows) = Self::parse_header(map.as_slice(), path)?;
        Ok(Self {
            fixed_len,
            rows,
            backing: Backing::Ro(map),
        })
    }

    fn parse_header(data: &[u8], path: &Path) -> CoreResult<(u32, u64)> {
        if data.len() < HEADER as usize || &data[..8] != MAGIC {
            return Err(CoreError::corruption(format!(
                "bad fixed-length store header: {}",
                path.display()
            )));
        }
        let fixed_len = u32::from_le_bytes(data[8..12].try_into().unwrap());
        let rows = u64::from_le_bytes(data[16..24].try_into().unwrap());
        if fixed_len == 0
            || HEADER + rows * u64::from(fixed_len) > data.len() as u64
        {
            return Err(CoreError::corruption(format!(
                "fixed-length store row count exceeds file: {}",
                path.display()
            )));
        }
        Ok((fixed_len, rows))
    }

    /// Cell width in bytes.
    #[must_use]
    pub fn fixed_len(&self) -> usize {
        self.fixed_len as usize
    }

    fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mut(m) => m.as_slice(),
            Backing::Ro(m) => m.as_slice(),
        }
    }

    fn cell_offset(&self, id: u64) -> u64 {
        HEADER + id * u64::from(self.fixed_len)
    }

    /// Returns cell `id` as a slice.
    pub fn cell(&self, id: u64) -> CoreResult<&[u8]> {
        check_row(id, self.rows)?;
        let off = self.cell_offset(id) as usize;
        Ok(&self.data()[off..off + self.fixed_len as usize])
    }

    /// Appends a cell; returns its physical id.
    pub fn append(&mut self, record: &[u8]) -> CoreResult<u64> {
        if record.len() != self.fixed_len as usize {
            return Err(CoreError::invalid_argument(format!(
                "fixed-length store expects {} bytes, got {}",
                self.fixed_len,
                record.len()
            )));
        }
        let id = self.rows;
        let end = self.cell_offset(id + 1);
        let Backing::Mut(map) = &mut self.backing else {
            return Err(CoreError::logic("append to a read-only fixed-length store"));
        };
        if end > map.len() {
            map.grow(end.div_ceil(GROW_CHUNK) * GROW_CHUNK)?;
        }
        map.write_at(HEADER + id * u64::from(self.fixed_len), record)?;
        self.rows = id + 1;
        map.write_at(16, &self.rows.to_le_bytes())?;
        Ok(id)
    }

    /// Rewrites cell `id` in place.
    pub fn write_cell(&mut self, id: u64, record: &[u8]) -> CoreResult<()> {
        check_row(id, self.rows)?;
        if record.len() != self.fixed_len as usize {
            return Err(CoreError::invalid_argument(format!(
                "fixed-length store expects {} bytes, got {}",
                self.fixed_len,
                record.len()
            )));
        }
        let off = self.cell_offset(id);
        match &mut self.backing {
            Backing::Mut(map) => map.write_at(off, record)?,
            Backing::Ro(_) => {
                return Err(CoreError::logic("write to a read-only fixed-length store"))
            }
        }
        Ok(())
    }

    /// Flushes dirty pages.
    pub fn flush(&self) -> CoreResult<()> {
        if let Backing::Mut(map) = &self.backing {
            map.flush()?;
        }
        Ok(())
    }

    fn current_path(&self) -> &Path {
        match &self.backing {
            Backing::Mut(m) => m.path(),
            Backing::Ro(m) => m.path(),
        }
    }
}

impl ReadableStore for FixedLenStore {
    fn num_rows(&self) -> u64 {
        self.rows
    }

    fn data_storage_size(&self) -> u64 {
        HEADER + self.rows * u64::from(self.fixed_len)
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        out.extend_from_slice(self.cell(id)?);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        if path == self.current_path() {
            return self.flush();
        }
        let used = self.data_storage_size() as usize;
        atomic_write(path, &self.data()[..used])?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "fixlen"
    }

    fn as_fixed(&self) -> Option<&FixedLenStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_read_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cg.fixlen");
        let mut store = FixedLenStore::create(&path, 8).unwrap();

        for i in 0..10u64 {
            let id = store.append(&i.to_le_bytes()).unwrap();
            assert_eq!(id, i);
        }
        assert_eq!(store.num_rows(), 10);
        assert_eq!(store.cell(3).unwrap(), 3u64.to_le_bytes());

        store.write_cell(3, &99u64.to_le_bytes()).unwrap();
        assert_eq!(store.cell(3).unwrap(), 99u64.to_le_bytes());
        assert!(store.cell(10).is_err());
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cg.fixlen");
        {
            let mut store = FixedLenStore::create(&path, 4).unwrap();
            store.append(&7u32.to_le_bytes()).unwrap();
            store.append(&8u32.to_le_bytes()).unwrap();
            store.flush().unwrap();
        }
        let store = FixedLenStore::open(&path).unwrap();
        assert_eq!(store.num_rows(), 2);
        assert_eq!(store.cell(1).unwrap(), 8u32.to_le_bytes());
    }

    #[test]
    fn save_elsewhere_and_load_readonly() {
        let dir = tempdir().unwrap();
        let mut store = FixedLenStore::create(&dir.path().join("a.fixlen"), 4).unwrap();
        store.append(&1u32.to_le_bytes()).unwrap();
        store.append(&2u32.to_le_bytes()).unwrap();

        let copy = dir.path().join("b.fixlen");
        store.save(&copy).unwrap();

        let loaded = FixedLenStore::load(&copy).unwrap();
        assert_eq!(loaded.num_rows(), 2);
        let mut out = Vec::new();
        loaded.get_value_append(1, &mut out).unwrap();
        assert_eq!(out, 2u32.to_le_bytes());
        assert!(loaded.as_fixed().is_some());
    }

    #[test]
    fn wrong_width_rejected() {
        let dir = tempdir().unwrap();
        let mut store = FixedLenStore::create(&dir.path().join("c.fixlen"), 4).unwrap();
        assert!(store.append(b"toolong").is_err());
    }
}
