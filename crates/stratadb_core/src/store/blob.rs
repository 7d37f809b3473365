//! Uncompressed variable-length record store.
//!
//! Records are streamed to the data file in append order; offsets stay in
//! memory until [`PlainBlobStore::finish`] writes them after the pool and
//! patches the header. Convert uses this as the temporary colgroup file for
//! variable-width colgroups, and it remains the fallback for data that is
//! read linearly.
//!
//! File layout: magic(8), rows u64, pool_len u64, pool bytes, offsets
//! `(rows + 1) × u64`.

use crate::error::{CoreError, CoreResult};
use crate::store::{check_row, ReadableStore};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use stratadb_storage::{read_all, MmapFile};

const MAGIC: &[u8; 8] = b"SDBLOB\0\0";
const HEADER: u64 = 24;

enum Backing {
    Building {
        writer: BufWriter<File>,
        path: PathBuf,
    },
    Loaded(MmapFile),
}

/// Append-only variable-length store.
pub struct PlainBlobStore {
    offsets: Vec<u64>,
    pool_len: u64,
    backing: Backing,
}

impl PlainBlobStore {
    /// Creates a new store file at `path` in building mode.
    pub fn create(path: &Path) -> CoreResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&[0u8; HEADER as usize])?;
        Ok(Self {
            offsets: vec![0],
            pool_len: 0,
            backing: Backing::Building {
                writer,
                path: path.to_path_buf(),
            },
        })
    }

    /// Appends a record; returns its physical id.
    pub fn append(&mut self, record: &[u8]) -> CoreResult<u64> {
        let Backing::Building { writer, .. } = &mut self.backing else {
            return Err(CoreError::logic("append to a finished blob store"));
        };
        writer.write_all(record)?;
        self.pool_len += record.len() as u64;
        self.offsets.push(self.pool_len);
        Ok(self.offsets.len() as u64 - 2)
    }

    /// Completes the file (offsets + header) and reopens it for reading.
    pub fn finish(&mut self) -> CoreResult<()> {
        let Backing::Building { writer, path } = &mut self.backing else {
            return Ok(());
        };
        for off in &self.offsets {
            writer.write_all(&off.to_le_bytes())?;
        }
        writer.flush()?;
        let file = writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(MAGIC)?;
        file.write_all(&(self.offsets.len() as u64 - 1).to_le_bytes())?;
        file.write_all(&self.pool_len.to_le_bytes())?;
        file.sync_all()?;
        let path = path.clone();
        self.backing = Backing::Loaded(MmapFile::open(&path)?);
        Ok(())
    }

    /// Opens a finished store.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let map = MmapFile::open(path)?;
        let data = map.as_slice();
        if data.len() < HEADER as usize || &data[..8] != MAGIC {
            return Err(CoreError::corruption(format!(
                "bad blob store header: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let pool_len = u64::from_le_bytes(data[16..24].try_into().unwrap());
        let offsets_start = HEADER + pool_len;
        let need = offsets_start + (rows + 1) * 8;
        if need > data.len() as u64 {
            return Err(CoreError::corruption(format!(
                "blob store truncated: {}",
                path.display()
            )));
        }
        let offsets = data[offsets_start as usize..need as usize]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self {
            offsets,
            pool_len,
            backing: Backing::Loaded(map),
        })
    }

    fn pool(&self) -> CoreResult<&[u8]> {
        match &self.backing {
            Backing::Loaded(map) => {
                Ok(&map.as_slice()[HEADER as usize..(HEADER + self.pool_len) as usize])
            }
            Backing::Building { .. } => Err(CoreError::logic("read from an unfinished blob store")),
        }
    }
}

impl ReadableStore for PlainBlobStore {
    fn num_rows(&self) -> u64 {
        self.offsets.len() as u64 - 1
    }

    fn data_storage_size(&self) -> u64 {
        HEADER + self.pool_len + self.offsets.len() as u64 * 8
    }

    fn data_inflate_size(&self) -> u64 {
        self.pool_len
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.num_rows())?;
        let pool = self.pool()?;
        let start = self.offsets[id as usize] as usize;
        let end = self.offsets[id as usize + 1] as usize;
        out.extend_from_slice(&pool[start..end]);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        match &self.backing {
            Backing::Loaded(map) => {
                if path == map.path() {
                    return Ok(());
                }
                stratadb_storage::atomic_write(path, &read_all(map.path())?)?;
                Ok(())
            }
            Backing::Building { .. } => Err(CoreError::logic("save of an unfinished blob store")),
        }
    }

    fn file_ext(&self) -> &'static str {
        "blob"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_finish_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cg.blob");
        let mut store = PlainBlobStore::create(&path).unwrap();

        assert_eq!(store.append(b"alpha").unwrap(), 0);
        assert_eq!(store.append(b"").unwrap(), 1);
        assert_eq!(store.append(b"gamma-long-record").unwrap(), 2);
        store.finish().unwrap();

        let mut out = Vec::new();
        store.get_value(1, &mut out).unwrap();
        assert_eq!(out, b"");
        store.get_value(2, &mut out).unwrap();
        assert_eq!(out, b"gamma-long-record");
        assert!(store.get_value(3, &mut out).is_err());
    }

    #[test]
    fn load_after_finish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cg.blob");
        {
            let mut store = PlainBlobStore::create(&path).unwrap();
            store.append(b"one").unwrap();
            store.append(b"two").unwrap();
            store.finish().unwrap();
        }
        let store = PlainBlobStore::load(&path).unwrap();
        assert_eq!(store.num_rows(), 2);
        assert_eq!(store.data_inflate_size(), 6);
        let mut out = Vec::new();
        store.get_value(0, &mut out).unwrap();
        assert_eq!(out, b"one");
    }

    #[test]
    fn read_before_finish_is_an_error() {
        let dir = tempdir().unwrap();
        let mut store = PlainBlobStore::create(&dir.path().join("x.blob")).unwrap();
        store.append(b"r").unwrap();
        let mut out = Vec::new();
        assert!(store.get_value(0, &mut out).is_err());
    }
}
