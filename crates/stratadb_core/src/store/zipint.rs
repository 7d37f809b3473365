//! Bit-packed integer store.
//!
//! For a single-integer-column colgroup, records are decoded, rebased on the
//! minimum value, and packed at the narrowest width that covers the spread.
//! Reads re-encode the original little-endian fixed-width record.
//!
//! File layout: magic(8), rows u64, min i128, width u8, type code u8,
//! pad(6), packed deltas (with an 16-byte zero guard so unaligned reads
//! never run off the end).

use crate::error::{CoreError, CoreResult};
use crate::schema::ColumnType;
use crate::store::{check_row, ReadableStore, SortableStrVec};
use std::path::Path;
use stratadb_storage::{atomic_write, MmapFile};

const MAGIC: &[u8; 8] = b"SDZIPINT";
const HEADER: usize = 40;
const GUARD: usize = 16;

enum Packed {
    Heap(Vec<u8>),
    Map(MmapFile),
}

/// Packed single-column integer store.
pub struct ZipIntStore {
    rows: u64,
    min: i128,
    width: u8,
    ty: ColumnType,
    packed: Packed,
}

impl ZipIntStore {
    /// Packs the records of `data`, each a little-endian integer of the
    /// width implied by `ty`.
    pub fn build(ty: ColumnType, data: &SortableStrVec) -> CoreResult<Self> {
        let byte_len = int_byte_len(ty)?;
        let mut values = Vec::with_capacity(data.len());
        for rec in data.iter() {
            if rec.len() != byte_len {
                return Err(CoreError::invalid_argument(format!(
                    "integer record of {} bytes, expected {byte_len}",
                    rec.len()
                )));
            }
            values.push(decode_int(ty, rec));
        }
        let min = values.iter().copied().min().unwrap_or(0);
        let max_delta = values
            .iter()
            .map(|&v| (v - min) as u64)
            .max()
            .unwrap_or(0);
        let width = (64 - max_delta.leading_zeros()).max(1) as u8;

        let mut packed = Vec::with_capacity((values.len() * width as usize).div_ceil(8) + GUARD);
        let mut acc: u128 = 0;
        let mut nbits = 0u32;
        for &v in &values {
            acc |= u128::from((v - min) as u64) << nbits;
            nbits += u32::from(width);
            while nbits >= 8 {
                packed.push(acc as u8);
                acc >>= 8;
                nbits -= 8;
            }
        }
        if nbits > 0 {
            packed.push(acc as u8);
        }
        packed.resize(packed.len() + GUARD, 0);

        Ok(Self {
            rows: values.len() as u64,
            min,
            width,
            ty,
            packed: Packed::Heap(packed),
        })
    }

    /// Opens a packed store file.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let map = MmapFile::open(path)?;
        let data = map.as_slice();
        if data.len() < HEADER || &data[..8] != MAGIC {
            return Err(CoreError::corruption(format!(
                "bad zip-int store header: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(data[8..16].try_into().unwrap());
        let min = i128::from_le_bytes(data[16..32].try_into().unwrap());
        let width = data[32];
        let ty = type_from_code(data[33], path)?;
        let need = HEADER + (rows as usize * width as usize).div_ceil(8) + GUARD;
        if width == 0 || width > 64 || data.len() < need {
            return Err(CoreError::corruption(format!(
                "zip-int store truncated: {}",
                path.display()
            )));
        }
        Ok(Self {
            rows,
            min,
            width,
            ty,
            packed: Packed::Map(map),
        })
    }

    fn packed_bytes(&self) -> &[u8] {
        match &self.packed {
            Packed::Heap(v) => v,
            Packed::Map(m) => &m.as_slice()[HEADER..],
        }
    }

    fn delta(&self, id: u64) -> u64 {
        let bit = id * u64::from(self.width);
        let byte = (bit / 8) as usize;
        let shift = (bit % 8) as u32;
        let bytes = self.packed_bytes();
        let mut word = [0u8; 16];
        word.copy_from_slice(&bytes[byte..byte + 16]);
        let mask = if self.width == 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        };
        ((u128::from_le_bytes(word) >> shift) as u64) & mask
    }
}

impl ReadableStore for ZipIntStore {
    fn num_rows(&self) -> u64 {
        self.rows
    }

    fn data_storage_size(&self) -> u64 {
        (HEADER + self.packed_bytes().len()) as u64
    }

    fn data_inflate_size(&self) -> u64 {
        self.rows * int_byte_len(self.ty).unwrap_or(8) as u64
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.rows)?;
        let value = self.min + i128::from(self.delta(id));
        encode_int(self.ty, value, out);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        if let Packed::Map(map) = &self.packed {
            if path == map.path() {
                return Ok(());
            }
        }
        let packed = self.packed_bytes();
        let mut data = Vec::with_capacity(HEADER + packed.len());
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&self.rows.to_le_bytes());
        data.extend_from_slice(&self.min.to_le_bytes());
        data.push(self.width);
        data.push(type_code(self.ty));
        data.extend_from_slice(&[0u8; 6]);
        data.extend_from_slice(packed);
        atomic_write(path, &data)?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        "zint"
    }
}

pub(crate) fn int_byte_len(ty: ColumnType) -> CoreResult<usize> {
    match ty {
        ColumnType::Int32 | ColumnType::Uint32 => Ok(4),
        ColumnType::Int64 | ColumnType::Uint64 => Ok(8),
        other => Err(CoreError::invalid_argument(format!(
            "not an integer column type: {}",
            other.tag()
        ))),
    }
}

pub(crate) fn decode_int(ty: ColumnType, rec: &[u8]) -> i128 {
    match ty {
        ColumnType::Int32 => i128::from(i32::from_le_bytes(rec.try_into().unwrap())),
        ColumnType::Uint32 => i128::from(u32::from_le_bytes(rec.try_into().unwrap())),
        ColumnType::Int64 => i128::from(i64::from_le_bytes(rec.try_into().unwrap())),
        ColumnType::Uint64 => i128::from(u64::from_le_bytes(rec.try_into().unwrap())),
        _ => unreachable!("checked by int_byte_len"),
    }
}

pub(crate) fn encode_int(ty: ColumnType, value: i128, out: &mut Vec<u8>) {
    match ty {
        ColumnType::Int32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
        ColumnType::Uint32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        ColumnType::Int64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
        ColumnType::Uint64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
        _ => unreachable!("checked by int_byte_len"),
    }
}

fn type_code(ty: ColumnType) -> u8 {
    match ty {
        ColumnType::Int32 => 0,
        ColumnType::Int64 => 1,
        ColumnType::Uint32 => 2,
        ColumnType::Uint64 => 3,
        _ => unreachable!("checked by int_byte_len"),
    }
}

fn type_from_code(code: u8, path: &Path) -> CoreResult<ColumnType> {
    Ok(match code {
        0 => ColumnType::Int32,
        1 => ColumnType::Int64,
        2 => ColumnType::Uint32,
        3 => ColumnType::Uint64,
        _ => {
            return Err(CoreError::corruption(format!(
                "bad zip-int type code {code}: {}",
                path.display()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vec_of(values: &[i32]) -> SortableStrVec {
        let mut v = SortableStrVec::new();
        for &x in values {
            v.push(&x.to_le_bytes());
        }
        v
    }

    #[test]
    fn roundtrip_signed() {
        let values = [-100, 5, 42, -100, 7_000_000];
        let store = ZipIntStore::build(ColumnType::Int32, &vec_of(&values)).unwrap();
        assert_eq!(store.num_rows(), 5);
        let mut out = Vec::new();
        for (i, &x) in values.iter().enumerate() {
            store.get_value(i as u64, &mut out).unwrap();
            assert_eq!(out, x.to_le_bytes());
        }
    }

    #[test]
    fn roundtrip_u64_extremes() {
        let mut data = SortableStrVec::new();
        for v in [0u64, 1, u64::MAX, u64::MAX - 7] {
            data.push(&v.to_le_bytes());
        }
        let store = ZipIntStore::build(ColumnType::Uint64, &data).unwrap();
        let mut out = Vec::new();
        store.get_value(2, &mut out).unwrap();
        assert_eq!(out, u64::MAX.to_le_bytes());
        store.get_value(0, &mut out).unwrap();
        assert_eq!(out, 0u64.to_le_bytes());
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.zint");
        let values = [3, 1, 4, 1, 5, 9, 2, 6];
        ZipIntStore::build(ColumnType::Int32, &vec_of(&values))
            .unwrap()
            .save(&path)
            .unwrap();

        let store = ZipIntStore::load(&path).unwrap();
        assert_eq!(store.num_rows(), 8);
        let mut out = Vec::new();
        for (i, &x) in values.iter().enumerate() {
            store.get_value(i as u64, &mut out).unwrap();
            assert_eq!(out, x.to_le_bytes());
        }
    }

    #[test]
    fn wrong_record_width_is_rejected() {
        let mut data = SortableStrVec::new();
        data.push(b"abc");
        assert!(ZipIntStore::build(ColumnType::Int32, &data).is_err());
    }
}
