//! Immutable sorted key → row-id index.
//!
//! One structure serves both key shapes: single-integer keys are rebased on
//! their minimum and stored at the narrowest byte width (`.zint` file);
//! every other key is pooled as sorted unique byte strings (`.skey` file).
//! Per unique key a posting list of physical row ids is kept, plus the
//! inverse row → key mapping so the index can double as the colgroup store
//! for its columns.

use crate::error::{CoreError, CoreResult};
use crate::index::{IndexIter, ReadableIndex};
use crate::schema::{ColumnType, Schema};
use crate::store::{check_row, decode_int, encode_int, int_byte_len, ReadableStore, SortableStrVec};
use std::cmp::Ordering;
use std::path::Path;
use stratadb_storage::{atomic_write, read_all};

const MAGIC_BYTES: &[u8; 8] = b"SDIKSKEY";
const MAGIC_INT: &[u8; 8] = b"SDIKZINT";

enum Keys {
    Bytes {
        pool: Vec<u8>,
        offsets: Vec<u32>, // nkeys + 1
    },
    Int {
        ty: ColumnType,
        min: i128,
        deltas: Vec<u64>, // sorted ascending
    },
}

/// Sorted immutable index.
pub struct SortedKeyIndex {
    unique: bool,
    keys: Keys,
    key_offsets: Vec<u32>, // nkeys + 1, into id_lists
    id_lists: Vec<u32>,
    row_key: Vec<u32>, // physical row id -> key index
}

impl SortedKeyIndex {
    /// Builds from the keys of physical rows `0..data.len()`.
    pub fn build(schema: &Schema, unique: bool, data: &SortableStrVec) -> CoreResult<Self> {
        let int_ty = (schema.column_num() == 1 && schema.column(0).ty.is_integer())
            .then(|| schema.column(0).ty);
        let order = match int_ty {
            Some(ty) => {
                let width = int_byte_len(ty)?;
                for rec in data.iter() {
                    if rec.len() != width {
                        return Err(CoreError::invalid_argument(format!(
                            "integer key of {} bytes, expected {width}",
                            rec.len()
                        )));
                    }
                }
                let mut idx: Vec<u32> = (0..data.len() as u32).collect();
                idx.sort_by_key(|&i| decode_int(ty, data.get(i as usize)));
                idx
            }
            None => data.sorted_indices(),
        };

        let mut key_offsets = vec![0u32];
        let mut id_lists = Vec::with_capacity(order.len());
        let mut row_key = vec![0u32; data.len()];
        let mut uniq: Vec<u32> = Vec::new(); // representative row per unique key
        for &row in &order {
            let is_new = match uniq.last() {
                Some(&prev) => data.get(prev as usize) != data.get(row as usize),
                None => true,
            };
            if is_new {
                key_offsets.push(id_lists.len() as u32);
                uniq.push(row);
            }
            id_lists.push(row);
            row_key[row as usize] = uniq.len() as u32 - 1;
            *key_offsets.last_mut().unwrap() = id_lists.len() as u32;
        }

        let keys = match int_ty {
            Some(ty) => {
                let values: Vec<i128> =
                    uniq.iter().map(|&r| decode_int(ty, data.get(r as usize))).collect();
                let min = values.first().copied().unwrap_or(0);
                Keys::Int {
                    ty,
                    min,
                    deltas: values.iter().map(|&v| (v - min) as u64).collect(),
                }
            }
            None => {
                let mut pool = Vec::new();
                let mut offsets = vec![0u32];
                for &r in &uniq {
                    pool.extend_from_slice(data.get(r as usize));
                    offsets.push(pool.len() as u32);
                }
                Keys::Bytes { pool, offsets }
            }
        };

        Ok(Self {
            unique,
            keys,
            key_offsets,
            id_lists,
            row_key,
        })
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.key_offsets.len() - 1
    }

    fn key_bytes_append(&self, key_i: usize, out: &mut Vec<u8>) {
        match &self.keys {
            Keys::Bytes { pool, offsets } => {
                out.extend_from_slice(
                    &pool[offsets[key_i] as usize..offsets[key_i + 1] as usize],
                );
            }
            Keys::Int { ty, min, deltas } => {
                encode_int(*ty, min + i128::from(deltas[key_i]), out);
            }
        }
    }

    /// Compares the stored key `key_i` against `target`.
    fn cmp_key(&self, key_i: usize, target: &[u8]) -> Ordering {
        match &self.keys {
            Keys::Bytes { pool, offsets } => {
                pool[offsets[key_i] as usize..offsets[key_i + 1] as usize].cmp(target)
            }
            Keys::Int { ty, min, deltas } => {
                let stored = min + i128::from(deltas[key_i]);
                match int_byte_len(*ty) {
                    Ok(w) if w == target.len() => stored.cmp(&decode_int(*ty, target)),
                    // a malformed target compares by its bytes, never equal
                    _ => {
                        let mut buf = Vec::new();
                        encode_int(*ty, stored, &mut buf);
                        buf.as_slice().cmp(target)
                    }
                }
            }
        }
    }

    /// First key index whose key is `>= target`.
    fn lower_bound(&self, target: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.num_keys();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp_key(mid, target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn postings(&self, key_i: usize) -> &[u32] {
        &self.id_lists[self.key_offsets[key_i] as usize..self.key_offsets[key_i + 1] as usize]
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.keys {
            Keys::Bytes { pool, offsets } => {
                out.extend_from_slice(MAGIC_BYTES);
                out.push(u8::from(self.unique));
                out.extend_from_slice(&[0u8; 7]);
                out.extend_from_slice(&(self.num_keys() as u64).to_le_bytes());
                out.extend_from_slice(&(self.row_key.len() as u64).to_le_bytes());
                out.extend_from_slice(&(self.id_lists.len() as u64).to_le_bytes());
                out.extend_from_slice(&(pool.len() as u64).to_le_bytes());
                put_u32s(&mut out, offsets);
                out.extend_from_slice(pool);
            }
            Keys::Int { ty, min, deltas } => {
                out.extend_from_slice(MAGIC_INT);
                out.push(u8::from(self.unique));
                out.extend_from_slice(&[0u8; 7]);
                out.extend_from_slice(&(self.num_keys() as u64).to_le_bytes());
                out.extend_from_slice(&(self.row_key.len() as u64).to_le_bytes());
                out.extend_from_slice(&(self.id_lists.len() as u64).to_le_bytes());
                out.extend_from_slice(&min.to_le_bytes());
                let width = delta_width(deltas);
                out.push(int_type_code(*ty));
                out.push(width);
                out.extend_from_slice(&[0u8; 6]);
                for &d in deltas {
                    out.extend_from_slice(&d.to_le_bytes()[..width as usize]);
                }
            }
        }
        put_u32s(&mut out, &self.key_offsets);
        put_u32s(&mut out, &self.id_lists);
        put_u32s(&mut out, &self.row_key);
        out
    }

    /// Loads either file shape, telling them apart by magic.
    pub fn load(path: &Path, unique: bool) -> CoreResult<Self> {
        let data = read_all(path)?;
        let bad = || CoreError::corruption(format!("bad index file: {}", path.display()));
        if data.len() < 40 {
            return Err(bad());
        }
        let magic: &[u8; 8] = data[..8].try_into().unwrap();
        let nkeys = u64::from_le_bytes(data[16..24].try_into().unwrap()) as usize;
        let rows = u64::from_le_bytes(data[24..32].try_into().unwrap()) as usize;
        let nids = u64::from_le_bytes(data[32..40].try_into().unwrap()) as usize;
        let mut pos = 40;
        let keys = match magic {
            m if m == MAGIC_BYTES => {
                let pool_len = u64::from_le_bytes(
                    data.get(pos..pos + 8).ok_or_else(bad)?.try_into().unwrap(),
                ) as usize;
                pos += 8;
                let offsets = get_u32s(&data, &mut pos, nkeys + 1).ok_or_else(bad)?;
                let pool = data.get(pos..pos + pool_len).ok_or_else(bad)?.to_vec();
                pos += pool_len;
                Keys::Bytes { pool, offsets }
            }
            m if m == MAGIC_INT => {
                let min =
                    i128::from_le_bytes(data.get(pos..pos + 16).ok_or_else(bad)?.try_into().unwrap());
                pos += 16;
                let ty = int_type_from_code(*data.get(pos).ok_or_else(bad)?).ok_or_else(bad)?;
                let width = *data.get(pos + 1).ok_or_else(bad)? as usize;
                pos += 8;
                if !matches!(width, 1 | 2 | 4 | 8) {
                    return Err(bad());
                }
                let mut deltas = Vec::with_capacity(nkeys);
                for _ in 0..nkeys {
                    let chunk = data.get(pos..pos + width).ok_or_else(bad)?;
                    let mut w = [0u8; 8];
                    w[..width].copy_from_slice(chunk);
                    deltas.push(u64::from_le_bytes(w));
                    pos += width;
                }
                Keys::Int { ty, min, deltas }
            }
            _ => return Err(bad()),
        };
        let key_offsets = get_u32s(&data, &mut pos, nkeys + 1).ok_or_else(bad)?;
        let id_lists = get_u32s(&data, &mut pos, nids).ok_or_else(bad)?;
        let row_key = get_u32s(&data, &mut pos, rows).ok_or_else(bad)?;
        Ok(Self {
            unique,
            keys,
            key_offsets,
            id_lists,
            row_key,
        })
    }
}

impl ReadableIndex for SortedKeyIndex {
    fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) -> CoreResult<()> {
        let k = self.lower_bound(key);
        if k < self.num_keys() && self.cmp_key(k, key) == Ordering::Equal {
            out.extend(self.postings(k).iter().map(|&id| u64::from(id)));
        }
        Ok(())
    }

    fn is_unique(&self) -> bool {
        self.unique
    }

    fn index_storage_size(&self) -> u64 {
        let keys = match &self.keys {
            Keys::Bytes { pool, offsets } => pool.len() + offsets.len() * 4,
            Keys::Int { deltas, .. } => 24 + deltas.len() * delta_width(deltas) as usize,
        };
        (40 + keys + (self.key_offsets.len() + self.id_lists.len() + self.row_key.len()) * 4)
            as u64
    }

    fn create_iter_forward(&self) -> Box<dyn IndexIter + '_> {
        Box::new(ForwardIter {
            index: self,
            key_i: 0,
            dup_i: 0,
        })
    }

    fn create_iter_backward(&self) -> Box<dyn IndexIter + '_> {
        Box::new(BackwardIter {
            index: self,
            // position one past the last entry of the last key
            key_i: self.num_keys(),
            dup_i: 0,
        })
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        atomic_write(path, &self.serialize())?;
        Ok(())
    }

    fn file_ext(&self) -> &'static str {
        match self.keys {
            Keys::Bytes { .. } => "skey",
            Keys::Int { .. } => "zint",
        }
    }
}

impl ReadableStore for SortedKeyIndex {
    fn num_rows(&self) -> u64 {
        self.row_key.len() as u64
    }

    fn data_storage_size(&self) -> u64 {
        self.index_storage_size()
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.num_rows())?;
        self.key_bytes_append(self.row_key[id as usize] as usize, out);
        Ok(())
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        ReadableIndex::save(self, path)
    }

    fn file_ext(&self) -> &'static str {
        ReadableIndex::file_ext(self)
    }
}

struct ForwardIter<'a> {
    index: &'a SortedKeyIndex,
    // next entry to be returned by increment
    key_i: usize,
    dup_i: usize,
}

impl IndexIter for ForwardIter<'_> {
    fn seek_lower_bound(&mut self, key: &[u8]) -> Option<(Ordering, u64)> {
        let k = self.index.lower_bound(key);
        if k >= self.index.num_keys() {
            self.key_i = k;
            self.dup_i = 0;
            return None;
        }
        let cmp = self.index.cmp_key(k, key);
        let id = u64::from(self.index.postings(k)[0]);
        self.key_i = k;
        self.dup_i = 1;
        self.advance_if_exhausted();
        Some((cmp, id))
    }

    fn increment(&mut self, id: &mut u64, key: &mut Vec<u8>) -> bool {
        if self.key_i >= self.index.num_keys() {
            return false;
        }
        *id = u64::from(self.index.postings(self.key_i)[self.dup_i]);
        key.clear();
        self.index.key_bytes_append(self.key_i, key);
        self.dup_i += 1;
        self.advance_if_exhausted();
        true
    }

    fn is_unique_in_schema(&self) -> bool {
        self.index.unique
    }
}

impl ForwardIter<'_> {
    fn advance_if_exhausted(&mut self) {
        while self.key_i < self.index.num_keys()
            && self.dup_i >= self.index.postings(self.key_i).len()
        {
            self.key_i += 1;
            self.dup_i = 0;
        }
    }
}

struct BackwardIter<'a> {
    index: &'a SortedKeyIndex,
    // next entry to return is postings(key_i - 1) from the back at dup_i
    key_i: usize,
    dup_i: usize,
}

impl IndexIter for BackwardIter<'_> {
    fn seek_lower_bound(&mut self, key: &[u8]) -> Option<(Ordering, u64)> {
        // last key <= target
        let lb = self.index.lower_bound(key);
        let k = if lb < self.index.num_keys()
            && self.index.cmp_key(lb, key) == Ordering::Equal
        {
            lb
        } else if lb == 0 {
            self.key_i = 0;
            self.dup_i = 0;
            return None;
        } else {
            lb - 1
        };
        let cmp = self.index.cmp_key(k, key);
        let postings = self.index.postings(k);
        let id = u64::from(postings[postings.len() - 1]);
        self.key_i = k + 1;
        self.dup_i = 1;
        self.advance_if_exhausted();
        Some((cmp, id))
    }

    fn increment(&mut self, id: &mut u64, key: &mut Vec<u8>) -> bool {
        if self.key_i == 0 {
            return false;
        }
        let postings = self.index.postings(self.key_i - 1);
        *id = u64::from(postings[postings.len() - 1 - self.dup_i]);
        key.clear();
        self.index.key_bytes_append(self.key_i - 1, key);
        self.dup_i += 1;
        self.advance_if_exhausted();
        true
    }

    fn is_unique_in_schema(&self) -> bool {
        self.index.unique
    }
}

impl BackwardIter<'_> {
    fn advance_if_exhausted(&mut self) {
        while self.key_i > 0 && self.dup_i >= self.index.postings(self.key_i - 1).len() {
            self.key_i -= 1;
            self.dup_i = 0;
        }
    }
}

fn delta_width(deltas: &[u64]) -> u8 {
    let max = deltas.iter().copied().max().unwrap_or(0);
    match max {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn int_type_code(ty: ColumnType) -> u8 {
    match ty {
        ColumnType::Int32 => 0,
        ColumnType::Int64 => 1,
        ColumnType::Uint32 => 2,
        ColumnType::Uint64 => 3,
        _ => unreachable!("only integer keys take the int path"),
    }
}

fn int_type_from_code(code: u8) -> Option<ColumnType> {
    Some(match code {
        0 => ColumnType::Int32,
        1 => ColumnType::Int64,
        2 => ColumnType::Uint32,
        3 => ColumnType::Uint64,
        _ => return None,
    })
}

fn put_u32s(out: &mut Vec<u8>, values: &[u32]) {
    for &v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn get_u32s(data: &[u8], pos: &mut usize, n: usize) -> Option<Vec<u32>> {
    let bytes = data.get(*pos..*pos + n * 4)?;
    *pos += n * 4;
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnMeta;
    use tempfile::tempdir;

    fn int_schema() -> Schema {
        Schema::new("a", vec![ColumnMeta::new("a", ColumnType::Int32)]).unwrap()
    }

    fn str_schema() -> Schema {
        Schema::new("s", vec![ColumnMeta::new("s", ColumnType::VarBinary)]).unwrap()
    }

    fn int_keys(values: &[i32]) -> SortableStrVec {
        let mut v = SortableStrVec::new();
        for &x in values {
            v.push(&x.to_le_bytes());
        }
        v
    }

    #[test]
    fn exact_search_int() {
        let data = int_keys(&[30, 10, 20, 10, -5]);
        let idx = SortedKeyIndex::build(&int_schema(), false, &data).unwrap();
        assert_eq!(idx.num_keys(), 4);

        let mut out = Vec::new();
        idx.search_exact_append(&10i32.to_le_bytes(), &mut out).unwrap();
        assert_eq!(out, vec![1, 3]);

        out.clear();
        idx.search_exact_append(&(-5i32).to_le_bytes(), &mut out).unwrap();
        assert_eq!(out, vec![4]);

        out.clear();
        idx.search_exact_append(&11i32.to_le_bytes(), &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn store_view_returns_row_keys() {
        let data = int_keys(&[30, 10, 20]);
        let idx = SortedKeyIndex::build(&int_schema(), false, &data).unwrap();
        let mut out = Vec::new();
        for (row, &v) in [30, 10, 20].iter().enumerate() {
            ReadableStore::get_value(&idx, row as u64, &mut out).unwrap();
            assert_eq!(out, (v as i32).to_le_bytes());
        }
    }

    #[test]
    fn forward_iteration_is_key_ordered() {
        let data = int_keys(&[30, 10, 20, 10]);
        let idx = SortedKeyIndex::build(&int_schema(), false, &data).unwrap();
        let mut iter = idx.create_iter_forward();

        let mut id = 0u64;
        let mut key = Vec::new();
        let mut seen = Vec::new();
        while iter.increment(&mut id, &mut key) {
            seen.push((i32::from_le_bytes(key.as_slice().try_into().unwrap()), id));
        }
        assert_eq!(seen, vec![(10, 1), (10, 3), (20, 2), (30, 0)]);
    }

    #[test]
    fn backward_iteration_reverses() {
        let data = int_keys(&[30, 10, 20, 10]);
        let idx = SortedKeyIndex::build(&int_schema(), false, &data).unwrap();
        let mut iter = idx.create_iter_backward();

        let mut id = 0u64;
        let mut key = Vec::new();
        let mut seen = Vec::new();
        while iter.increment(&mut id, &mut key) {
            seen.push((i32::from_le_bytes(key.as_slice().try_into().unwrap()), id));
        }
        assert_eq!(seen, vec![(30, 0), (20, 2), (10, 3), (10, 1)]);
    }

    #[test]
    fn seek_lower_bound_reports_cmp() {
        let data = int_keys(&[30, 10, 20]);
        let idx = SortedKeyIndex::build(&int_schema(), true, &data).unwrap();
        let mut iter = idx.create_iter_forward();

        let (cmp, id) = iter.seek_lower_bound(&20i32.to_le_bytes()).unwrap();
        assert_eq!(cmp, Ordering::Equal);
        assert_eq!(id, 2);

        let (cmp, id) = iter.seek_lower_bound(&15i32.to_le_bytes()).unwrap();
        assert_eq!(cmp, Ordering::Greater);
        assert_eq!(id, 2);

        assert!(iter.seek_lower_bound(&31i32.to_le_bytes()).is_none());
        assert!(iter.is_unique_in_schema());
    }

    #[test]
    fn byte_keys_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index-s.skey");

        let mut data = SortableStrVec::new();
        for k in ["pear", "apple", "pear", "fig"] {
            data.push(k.as_bytes());
        }
        let idx = SortedKeyIndex::build(&str_schema(), false, &data).unwrap();
        assert_eq!(ReadableIndex::file_ext(&idx), "skey");
        ReadableIndex::save(&idx, &path).unwrap();

        let loaded = SortedKeyIndex::load(&path, false).unwrap();
        let mut out = Vec::new();
        loaded.search_exact_append(b"pear", &mut out).unwrap();
        assert_eq!(out, vec![0, 2]);
        let mut key = Vec::new();
        ReadableStore::get_value(&loaded, 3, &mut key).unwrap();
        assert_eq!(key, b"fig");
    }

    #[test]
    fn int_keys_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index-a.zint");

        let data = int_keys(&[1_000_000, -7, 55, -7]);
        let idx = SortedKeyIndex::build(&int_schema(), false, &data).unwrap();
        assert_eq!(ReadableIndex::file_ext(&idx), "zint");
        ReadableIndex::save(&idx, &path).unwrap();

        let loaded = SortedKeyIndex::load(&path, false).unwrap();
        let mut out = Vec::new();
        loaded.search_exact_append(&(-7i32).to_le_bytes(), &mut out).unwrap();
        assert_eq!(out, vec![1, 3]);
        out.clear();
        loaded
            .search_exact_append(&1_000_000i32.to_le_bytes(), &mut out)
            .unwrap();
        assert_eq!(out, vec![0]);
    }
}
