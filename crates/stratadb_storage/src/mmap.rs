//! Memory-mapped file wrappers.
//!
//! Two flavors:
//! - [`MmapFile`]: read-only view of a whole file.
//! - [`MmapFileMut`]: writable mapping that can grow in place; used for
//!   bitmaps and fixed-length cell stores that are updated at a byte offset
//!   without rewriting the file.
//!
//! Mapping an empty file is not portable, so both types treat a zero-length
//! file as an empty slice without creating a mapping.

use crate::error::{StorageError, StorageResult};
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Read-only memory-mapped file.
pub struct MmapFile {
    map: Option<Mmap>,
    len: u64,
    path: PathBuf,
}

impl MmapFile {
    /// Opens and maps an existing file read-only.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is dropped before the file; callers must
            // not truncate the file while the map is alive.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { map, len, path })
    }

    /// Returns the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Returns the file length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the path this file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn slice_at(&self, offset: u64, len: usize) -> StorageResult<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&e| e <= self.len)
            .ok_or(StorageError::OutOfRange {
                offset,
                len,
                size: self.len,
            })?;
        Ok(&self.as_slice()[offset as usize..end as usize])
    }
}

impl std::fmt::Debug for MmapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

/// Writable, growable memory-mapped file.
///
/// Growth remaps: `set_len` on the underlying file, then a fresh mapping.
/// Callers are expected to grow in coarse chunks so remaps stay rare.
pub struct MmapFileMut {
    file: File,
    map: Option<MmapMut>,
    len: u64,
    path: PathBuf,
}

impl MmapFileMut {
    /// Creates (or truncates) a file of `initial_len` bytes and maps it.
    pub fn create(path: impl AsRef<Path>, initial_len: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(initial_len)?;
        let map = Self::map(&file, initial_len)?;
        Ok(Self {
            file,
            map,
            len: initial_len,
            path,
        })
    }

    /// Opens an existing file read-write and maps it whole.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let map = Self::map(&file, len)?;
        Ok(Self {
            file,
            map,
            len,
            path,
        })
    }

    fn map(file: &File, len: u64) -> StorageResult<Option<MmapMut>> {
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: same aliasing contract as `MmapFile::open`.
        Ok(Some(unsafe { MmapMut::map_mut(file)? }))
    }

    /// Returns the file length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the path this file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Returns the mapped bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    /// Extends the file to `new_len` bytes and remaps.
    ///
    /// Shrinking is rejected; a mapping over truncated pages would fault.
    pub fn grow(&mut self, new_len: u64) -> StorageResult<()> {
        if new_len < self.len {
            return Err(StorageError::corrupt(
                &self.path,
                format!("grow to {new_len} below current size {}", self.len),
            ));
        }
        if new_len == self.len {
            return Ok(());
        }
        if let Some(map) = self.map.take() {
            map.flush()?;
            drop(map);
        }
        self.file.set_len(new_len)?;
        self.map = Self::map(&self.file, new_len)?;
        self.len = new_len;
        Ok(())
    }

    /// Writes `data` at `offset`. The range must already be inside the file.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let end =
            offset
                .checked_add(data.len() as u64)
                .filter(|&e| e <= self.len)
                .ok_or(StorageError::OutOfRange {
                    offset,
                    len: data.len(),
                    size: self.len,
                })?;
        self.as_mut_slice()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn slice_at(&self, offset: u64, len: usize) -> StorageResult<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .filter(|&e| e <= self.len)
            .ok_or(StorageError::OutOfRange {
                offset,
                len,
                size: self.len,
            })?;
        Ok(&self.as_slice()[offset as usize..end as usize])
    }

    /// Flushes dirty pages to disk.
    pub fn flush(&self) -> StorageResult<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MmapFileMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapFileMut")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_readonly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();

        let map = MmapFile::open(&path).unwrap();
        assert_eq!(map.as_slice(), b"hello world");
        assert_eq!(map.slice_at(6, 5).unwrap(), b"world");
        assert!(map.slice_at(6, 6).is_err());
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let map = MmapFile::open(&path).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.as_slice(), b"");
    }

    #[test]
    fn write_and_grow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow");

        let mut map = MmapFileMut::create(&path, 8).unwrap();
        map.write_at(0, &42u64.to_le_bytes()).unwrap();
        map.grow(16).unwrap();
        map.write_at(8, &7u64.to_le_bytes()).unwrap();
        map.flush().unwrap();
        drop(map);

        let map = MmapFile::open(&path).unwrap();
        assert_eq!(map.len(), 16);
        assert_eq!(&map.as_slice()[..8], &42u64.to_le_bytes());
        assert_eq!(&map.as_slice()[8..], &7u64.to_le_bytes());
    }

    #[test]
    fn grow_rejects_shrink() {
        let dir = tempdir().unwrap();
        let mut map = MmapFileMut::create(dir.path().join("f"), 16).unwrap();
        assert!(map.grow(8).is_err());
    }

    #[test]
    fn write_past_end_is_out_of_range() {
        let dir = tempdir().unwrap();
        let mut map = MmapFileMut::create(dir.path().join("f"), 4).unwrap();
        let err = map.write_at(2, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange { .. }));
    }
}
