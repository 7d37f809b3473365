//! Block-compressed variable-length store.
//!
//! Records are grouped into blocks of roughly 64 KiB of raw bytes and each
//! block is zstd-compressed on its own, so a point read decompresses one
//! block. A raw block is self-describing: record count, record end offsets,
//! then the payloads.
//!
//! File layout: magic(8), rows u64, block count u32, pad u32, block
//! directory (`first_row` u64, `comp_off` u64, `comp_len` u32, `raw_len`
//! u32 each), then the compressed blocks.

use crate::error::{CoreError, CoreResult};
use crate::store::{check_row, ReadableStore, SortableStrVec};
use std::path::Path;
use stratadb_storage::{atomic_write, MmapFile};

const MAGIC: &[u8; 8] = b"SDZBLOB\0";
const HEADER: usize = 24;
const DIR_ENTRY: usize = 24;
const BLOCK_RAW_TARGET: usize = 64 * 1024;
const ZSTD_LEVEL: i32 = 1;

#[derive(Debug, Clone, Copy)]
struct BlockRef {
    first_row: u64,
    comp_off: u64,
    comp_len: u32,
    raw_len: u32,
}

enum Backing {
    Heap(Vec<u8>),
    Map(MmapFile),
}

/// Zstd block store for one compression chunk.
pub struct CompressedBlobStore {
    rows: u64,
    inflate: u64,
    blocks: Vec<BlockRef>,
    // compressed block bytes, contiguous
    data: Backing,
}

impl CompressedBlobStore {
    /// Compresses the records of `data` into blocks.
    pub fn build(data: &SortableStrVec) -> CoreResult<Self> {
        let mut blocks = Vec::new();
        let mut comp = Vec::new();
        let mut raw = Vec::new();
        let mut ends: Vec<u32> = Vec::new();
        let mut first_row = 0u64;

        let mut flush =
            |raw: &mut Vec<u8>, ends: &mut Vec<u32>, first_row: &mut u64, row: u64| -> CoreResult<()> {
                if ends.is_empty() {
                    return Ok(());
                }
                let mut block = Vec::with_capacity(4 + ends.len() * 4 + raw.len());
                block.extend_from_slice(&(ends.len() as u32).to_le_bytes());
                for &e in ends.iter() {
                    block.extend_from_slice(&e.to_le_bytes());
                }
                block.extend_from_slice(raw);
                let packed = zstd::bulk::compress(&block, ZSTD_LEVEL)?;
                blocks.push(BlockRef {
                    first_row: *first_row,
                    comp_off: comp.len() as u64,
                    comp_len: packed.len() as u32,
                    raw_len: block.len() as u32,
                });
                comp.extend_from_slice(&packed);
                raw.clear();
                ends.clear();
                *first_row = row;
                Ok(())
            };

        for (row, rec) in data.iter().enumerate() {
            if !ends.is_empty() && raw.len() + rec.len() > BLOCK_RAW_TARGET {
                flush(&mut raw, &mut ends, &mut first_row, row as u64)?;
            }
            raw.extend_from_slice(rec);
            ends.push(raw.len() as u32);
        }
        flush(&mut raw, &mut ends, &mut first_row, data.len() as u64)?;

        Ok(Self {
            rows: data.len() as u64,
            inflate: data.str_size() as u64,
            blocks,
            data: Backing::Heap(comp),
        })
    }

    /// Opens a block store file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let map = MmapFile::open(path)?;
        let data = map.as_slice();
        if data.len() < HEADER || &data[..8] != MAGIC {
            return Err(CoreError::corruption(format!(
                "bad block store header: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let nblocks = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;
        let dir_end = HEADER + nblocks * DIR_ENTRY;
        if data.len() < dir_end {
            return Err(CoreError::corruption(format!(
                "block store directory truncated: {}",
                path.display()
            )));
        }
        let mut blocks = Vec::with_capacity(nblocks);
        let mut inflate = 0u64;
        for i in 0..nblocks {
            let e = &data[HEADER + i * DIR_ENTRY..HEADER + (i + 1) * DIR_ENTRY];
            let block = BlockRef {
                first_row: u64::from_le_bytes(e[0..8].try_into().unwrap()),
                comp_off: u64::from_le_bytes(e[8..16].try_into().unwrap()),
                comp_len: u32::from_le_bytes(e[16..20].try_into().unwrap()),
                raw_len: u32::from_le_bytes(e[20..24].try_into().unwrap()),
            };
            inflate += u64::from(block.raw_len);
            blocks.push(block);
        }
        Ok(Self {
            rows,
            inflate,
            blocks,
            data: Backing::Map(map),
        })
    }

    fn comp_data(&self) -> &[u8] {
        match &self.data {
            Backing::Heap(v) => v,
            Backing::Map(m) => {
                let dir_end = HEADER + self.blocks.len() * DIR_ENTRY;
                &m.as_slice()[dir_end..]
            }
        }
    }

    fn block_of_row(&self, id: u64) -> usize {
        self.blocks.partition_point(|b| b.first_row <= id) - 1
    }
}

impl ReadableStore for CompressedBlobStore {
    fn num_rows(&self) -> u64 {
        self.rows
    }

    fn data_storage_size(&self) -> u64 {
        (HEADER + self.blocks.len() * DIR_ENTRY + self.comp_data().len()) as u64
    }

    fn data_inflate_size(&self) -> u64 {
        self.inflate
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.rows)?;
        let b = self.block_of_row(id);
        let block = self.blocks[b];
        let comp = &self.comp_data()
            [block.comp_off as usize..block.comp_off as usize + block.comp_len as usize];
        let raw = zstd::bulk::decompress(comp, block.raw_len as usize)?;
        let count = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
        let local = (id - block.first_row) as usize;
        if local >= count {
            return Err(CoreError::corruption(format!(
                "row {id} not in its block ({count} records)"
            )));
        }
        let end_at = |i: usize| {
            u32::from_le_bytes(raw[4 + i * 4..8 + i * 4].try_into().unwrap()) as usize
        };
        let payload = &raw[4 + count * 4..];
        let start = if local == 0 { 0 } else { end_at(local - 1) };
        out.extend_from_slice(&payload[start..end_at(local)]);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        if let Backing::Map(map) = &self.data {
            if path == map.path() {
                return Ok(());
            }
        }
        let comp = self.comp_data();
        let mut data = Vec::with_capacity(HEADER + self.blocks.len() * DIR_ENTRY + comp.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&self.rows.to_le_bytes());
        data.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        for b in &self.blocks {
            data.extend_from_slice(&b.first_row.to_le_bytes());
            data.extend_from_slice(&b.comp_off.to_le_bytes());
            data.extend_from_slice(&b.comp_len.to_le_bytes());
            data.extend_from_slice(&b.raw_len.to_le_bytes());
        }
        data.extend_from_slice(comp);
        atomic_write(path, &data)?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "zblob"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(n: usize) -> SortableStrVec {
        let mut v = SortableStrVec::new();
        for i in 0..n {
            v.push(format!("record-{i:05}-{}", "x".repeat(i % 50)).as_bytes());
        }
        v
    }

    #[test]
    fn roundtrip_single_block() {
        let data = sample(10);
        let store = CompressedBlobStore::build(&data).unwrap();
        assert_eq!(store.num_rows(), 10);
        let mut out = Vec::new();
        for i in 0..10 {
            store.get_value(i as u64, &mut out).unwrap();
            assert_eq!(out, data.get(i));
        }
    }

    #[test]
    fn roundtrip_many_blocks() {
        // enough raw bytes to force several 64 KiB blocks
        let mut data = SortableStrVec::new();
        for i in 0..3000usize {
            data.push(format!("{i:06}{}", "payload".repeat(10)).as_bytes());
        }
        let store = CompressedBlobStore::build(&data).unwrap();
        assert!(store.blocks.len() > 1);

        let mut out = Vec::new();
        for i in [0usize, 1, 1234, 2998, 2999] {
            store.get_value(i as u64, &mut out).unwrap();
            assert_eq!(out, data.get(i));
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cg.zblob");
        let data = sample(100);
        CompressedBlobStore::build(&data).unwrap().save(&path).unwrap();

        let store = CompressedBlobStore::load(&path).unwrap();
        assert_eq!(store.num_rows(), 100);
        let mut out = Vec::new();
        store.get_value(99, &mut out).unwrap();
        assert_eq!(out, data.get(99));
        assert!(store.get_value(100, &mut out).is_err());
    }

    #[test]
    fn empty_chunk() {
        let store = CompressedBlobStore::build(&SortableStrVec::new()).unwrap();
        assert_eq!(store.num_rows(), 0);
    }
}
