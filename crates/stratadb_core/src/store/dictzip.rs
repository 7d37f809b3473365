//! Dictionary-compressed record store.
//!
//! For colgroups with long, similar records, a zstd dictionary is trained on
//! a sample of the input and every record is compressed against it
//! individually, so point reads decompress exactly one record.
//!
//! File layout: magic(8), rows u64, dict_len u32, max_raw u32, offsets
//! `(rows + 1) × u64` (relative to the frame area), dictionary bytes,
//! frames.

use crate::error::{CoreError, CoreResult};
use crate::store::{check_row, ReadableStore};
use std::path::Path;
use stratadb_storage::{atomic_write, MmapFile};

const MAGIC: &[u8; 8] = b"SDDICTZP";
const HEADER: usize = 24;
const ZSTD_LEVEL: i32 = 3;
const MAX_SAMPLES: usize = 1024;
const DICT_CAPACITY: usize = 16 * 1024;

enum Backing {
    Heap(Vec<u8>),
    Map(MmapFile),
}

/// Per-record dictionary-compressed store.
pub struct DictZipStore {
    rows: u64,
    max_raw: u32,
    inflate: u64,
    dict: Vec<u8>,
    offsets: Vec<u64>,
    frames: Backing,
}

impl DictZipStore {
    /// Builds the store from `source`, keeping the physical ids for which
    /// `keep` returns true. Two passes: sample + train, then compress.
    pub fn build(
        source: &dyn ReadableStore,
        keep: &dyn Fn(u64) -> bool,
    ) -> CoreResult<Self> {
        let src_rows = source.num_rows();
        let mut buf = Vec::new();

        // sample every k-th kept record for dictionary training
        let kept: Vec<u64> = (0..src_rows).filter(|&id| keep(id)).collect();
        let step = (kept.len() / MAX_SAMPLES).max(1);
        let mut samples: Vec<Vec<u8>> = Vec::new();
        for &id in kept.iter().step_by(step) {
            source.get_value(id, &mut buf)?;
            if !buf.is_empty() {
                samples.push(buf.clone());
            }
        }
        let dict = match zstd::dict::from_samples(&samples, DICT_CAPACITY) {
            Ok(d) => d,
            Err(err) => {
                // too little or too uniform data to train on
                tracing::debug!(%err, "dictionary training failed, compressing without one");
                Vec::new()
            }
        };

        let mut frames = Vec::new();
        let mut offsets = Vec::with_capacity(kept.len() + 1);
        offsets.push(0u64);
        let mut max_raw = 0u32;
        let mut inflate = 0u64;
        let mut compressor = new_compressor(&dict)?;
        for &id in &kept {
            source.get_value(id, &mut buf)?;
            max_raw = max_raw.max(buf.len() as u32);
            inflate += buf.len() as u64;
            let frame = compressor.compress(&buf)?;
            frames.extend_from_slice(&frame);
            offsets.push(frames.len() as u64);
        }

        Ok(Self {
            rows: kept.len() as u64,
            max_raw,
            inflate,
            dict,
            offsets,
            frames: Backing::Heap(frames),
        })
    }

    /// Opens a store file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let map = MmapFile::open(path)?;
        let data = map.as_slice();
        if data.len() < HEADER || &data[..8] != MAGIC {
            return Err(CoreError::corruption(format!(
                "bad dict-zip store header: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let dict_len = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;
        let max_raw = u32::from_le_bytes(data[20..24].try_into().unwrap());
        let offsets_end = HEADER + (rows as usize + 1) * 8;
        let frames_start = offsets_end + dict_len;
        if data.len() < frames_start {
            return Err(CoreError::corruption(format!(
                "dict-zip store truncated: {}",
                path.display()
            )));
        }
        let offsets: Vec<u64> = data[HEADER..offsets_end]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let dict = data[offsets_end..frames_start].to_vec();
        let inflate = u64::from(max_raw) * rows;
        Ok(Self {
            rows,
            max_raw,
            inflate,
            dict,
            offsets,
            frames: Backing::Map(map),
        })
    }

    fn frames(&self) -> &[u8] {
        match &self.frames {
            Backing::Heap(v) => v,
            Backing::Map(m) => {
                let start = HEADER + (self.rows as usize + 1) * 8 + self.dict.len();
                &m.as_slice()[start..]
            }
        }
    }
}

fn new_compressor(dict: &[u8]) -> CoreResult<zstd::bulk::Compressor<'static>> {
    let c = if dict.is_empty() {
        zstd::bulk::Compressor::new(ZSTD_LEVEL)?
    } else {
        zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, dict)?
    };
    Ok(c)
}

fn new_decompressor(dict: &[u8]) -> CoreResult<zstd::bulk::Decompressor<'static>> {
    let d = if dict.is_empty() {
        zstd::bulk::Decompressor::new()?
    } else {
        zstd::bulk::Decompressor::with_dictionary(dict)?
    };
    Ok(d)
}

impl ReadableStore for DictZipStore {
    fn num_rows(&self) -> u64 {
        self.rows
    }

    fn data_storage_size(&self) -> u64 {
        (HEADER + (self.rows as usize + 1) * 8 + self.dict.len() + self.frames().len()) as u64
    }

    fn data_inflate_size(&self) -> u64 {
        self.inflate
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.rows)?;
        let frames = self.frames();
        let frame = &frames[self.offsets[id as usize] as usize..self.offsets[id as usize + 1] as usize];
        let mut dec = new_decompressor(&self.dict)?;
        let raw = dec.decompress(frame, self.max_raw as usize)?;
        out.extend_from_slice(&raw);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        if let Backing::Map(map) = &self.frames {
            if path == map.path() {
                return Ok(());
            }
        }
        let frames = self.frames();
        let mut data =
            Vec::with_capacity(HEADER + self.offsets.len() * 8 + self.dict.len() + frames.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&self.rows.to_le_bytes());
        data.extend_from_slice(&(self.dict.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.max_raw.to_le_bytes());
        for off in &self.offsets {
            data.extend_from_slice(&off.to_le_bytes());
        }
        data.extend_from_slice(&self.dict);
        data.extend_from_slice(frames);
        atomic_write(path, &data)?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "dictzip"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PlainBlobStore;
    use tempfile::tempdir;

    fn source(dir: &Path, n: usize) -> PlainBlobStore {
        let mut store = PlainBlobStore::create(&dir.join("src.blob")).unwrap();
        for i in 0..n {
            store
                .append(format!("shared-prefix-{:04}-{}", i, "body".repeat(30)).as_bytes())
                .unwrap();
        }
        store.finish().unwrap();
        store
    }

    #[test]
    fn roundtrip_all_rows() {
        let dir = tempdir().unwrap();
        let src = source(dir.path(), 200);
        let store = DictZipStore::build(&src, &|_| true).unwrap();
        assert_eq!(store.num_rows(), 200);

        let mut got = Vec::new();
        let mut want = Vec::new();
        for i in [0u64, 7, 150, 199] {
            store.get_value(i, &mut got).unwrap();
            src.get_value(i, &mut want).unwrap();
            assert_eq!(got, want);
        }
        assert!(store.data_storage_size() < src.data_inflate_size());
    }

    #[test]
    fn skip_filter_compacts_ids() {
        let dir = tempdir().unwrap();
        let src = source(dir.path(), 10);
        let store = DictZipStore::build(&src, &|id| id % 2 == 0).unwrap();
        assert_eq!(store.num_rows(), 5);

        let mut got = Vec::new();
        let mut want = Vec::new();
        store.get_value(3, &mut got).unwrap();
        src.get_value(6, &mut want).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let src = source(dir.path(), 50);
        let path = dir.path().join("cg.dictzip");
        DictZipStore::build(&src, &|_| true).unwrap().save(&path).unwrap();

        let store = DictZipStore::load(&path).unwrap();
        assert_eq!(store.num_rows(), 50);
        let mut got = Vec::new();
        let mut want = Vec::new();
        store.get_value(49, &mut got).unwrap();
        src.get_value(49, &mut want).unwrap();
        assert_eq!(got, want);
    }
}
