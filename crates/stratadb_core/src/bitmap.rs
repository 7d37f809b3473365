//! Bit vectors for deletion tracking.
//!
//! Three layers:
//! - [`BitVec`]: a plain packed bit vector.
//! - [`RankSelect0`]: an immutable bit vector with rank0/select0 caches,
//!   used for the `is_purged` logical/physical id translation.
//! - [`DelBitmap`]: the `is_del` bitmap of a segment, an in-memory
//!   [`BitVec`] optionally written through to an mmap-backed file, so bit
//!   flips persist in place without rewriting the file.
//!
//! The `IsDel` file layout is an 8-byte LE row count followed by the packed
//! words; the file grows in fixed chunks so remaps stay rare.

use crate::error::{CoreError, CoreResult};
use std::path::Path;
use stratadb_storage::{atomic_write, MmapFileMut};

const WORD_BITS: usize = 64;

/// Growth unit of the mmap-backed `IsDel` file, in bytes.
const ISDEL_CHUNK: u64 = 8 * 1024;

/// Byte length of the `IsDel` header (LE row count).
const ISDEL_HEADER: u64 = 8;

/// A packed bit vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
}

impl BitVec {
    /// Creates an empty bit vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a vector of `len` bits, all set to `value`.
    #[must_use]
    pub fn with_len(len: usize, value: bool) -> Self {
        let fill = if value { u64::MAX } else { 0 };
        let mut v = Self {
            words: vec![fill; len.div_ceil(WORD_BITS)],
            len,
        };
        v.clear_tail();
        v
    }

    /// Reconstructs a vector from packed LE words.
    pub fn from_bytes(bytes: &[u8], len: usize) -> CoreResult<Self> {
        let need = len.div_ceil(WORD_BITS) * 8;
        if bytes.len() < need {
            return Err(CoreError::corruption(format!(
                "bitmap needs {need} bytes for {len} bits, got {}",
                bytes.len()
            )));
        }
        let words = bytes[..need]
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let mut v = Self { words, len };
        v.clear_tail();
        Ok(v)
    }

    /// Serializes the packed LE words.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8);
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn clear_tail(&mut self) {
        let rem = self.len % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the vector holds no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns bit `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.words[i / WORD_BITS] >> (i % WORD_BITS) & 1 == 1
    }

    /// Sets bit `i`; returns true if it was previously clear.
    pub fn set1(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let word = &mut self.words[i / WORD_BITS];
        let mask = 1u64 << (i % WORD_BITS);
        let changed = *word & mask == 0;
        *word |= mask;
        changed
    }

    /// Clears bit `i`; returns true if it was previously set.
    pub fn set0(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let word = &mut self.words[i / WORD_BITS];
        let mask = 1u64 << (i % WORD_BITS);
        let changed = *word & mask != 0;
        *word &= !mask;
        changed
    }

    /// Sets bits `[begin, end)`.
    pub fn set_range1(&mut self, begin: usize, end: usize) {
        for i in begin..end {
            self.set1(i);
        }
    }

    /// Appends a bit.
    pub fn push(&mut self, value: bool) {
        if self.len % WORD_BITS == 0 {
            self.words.push(0);
        }
        if value {
            let i = self.len;
            self.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
        }
        self.len += 1;
    }

    /// Number of set bits.
    #[must_use]
    pub fn popcnt(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Word index touched by bit `i`, for write-through persistence.
    fn word_of(i: usize) -> usize {
        i / WORD_BITS
    }

    fn word(&self, idx: usize) -> u64 {
        self.words[idx]
    }
}

/// Immutable bit vector with O(1) rank0 and O(log n) select0.
///
/// `rank0(i)` counts clear bits below `i`; `select0(k)` finds the position of
/// the k-th clear bit. Used to translate logical ids to physical ids over a
/// purged segment's `is_purged` bitmap.
#[derive(Debug, Clone)]
pub struct RankSelect0 {
    bits: BitVec,
    zeros_before: Vec<u32>,
    total_zeros: usize,
}

impl RankSelect0 {
    /// Builds the caches over `bits`.
    #[must_use]
    pub fn new(bits: BitVec) -> Self {
        let mut zeros_before = Vec::with_capacity(bits.words.len());
        let mut acc = 0usize;
        for (w, &word) in bits.words.iter().enumerate() {
            zeros_before.push(acc as u32);
            let bits_in_word = (bits.len - w * WORD_BITS).min(WORD_BITS);
            acc += bits_in_word - (word.count_ones() as usize);
        }
        Self {
            bits,
            zeros_before,
            total_zeros: acc,
        }
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns true if the vector holds no bits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns bit `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i)
    }

    /// Counts clear bits in `[0, i)`.
    #[must_use]
    pub fn rank0(&self, i: usize) -> usize {
        debug_assert!(i <= self.bits.len());
        if i == self.bits.len() {
            return self.total_zeros;
        }
        let w = i / WORD_BITS;
        let r = i % WORD_BITS;
        let ones_low = (self.bits.word(w) & ((1u64 << r) - 1)).count_ones() as usize;
        self.zeros_before[w] as usize + (r - ones_low)
    }

    /// Position of the k-th clear bit (0-based). `k` must be below
    /// [`Self::max_rank0`].
    #[must_use]
    pub fn select0(&self, k: usize) -> usize {
        debug_assert!(k < self.total_zeros);
        // last block whose prefix count is <= k
        let w = self.zeros_before.partition_point(|&z| z as usize <= k) - 1;
        let mut remaining = k - self.zeros_before[w] as usize;
        let word = self.bits.word(w);
        let base = w * WORD_BITS;
        for b in 0..WORD_BITS.min(self.bits.len - base) {
            if word >> b & 1 == 0 {
                if remaining == 0 {
                    return base + b;
                }
                remaining -= 1;
            }
        }
        unreachable!("select0 index exhausted the block cache")
    }

    /// Total count of clear bits.
    #[must_use]
    pub fn max_rank0(&self) -> usize {
        self.total_zeros
    }

    /// Total count of set bits.
    #[must_use]
    pub fn max_rank1(&self) -> usize {
        self.bits.len() - self.total_zeros
    }

    /// Borrows the underlying bits.
    #[must_use]
    pub fn bits(&self) -> &BitVec {
        &self.bits
    }
}

/// A segment's `is_del` bitmap: heap bits with optional mmap write-through.
///
/// In detached form (freshly built segments) the bits live on the heap and
/// are persisted with [`DelBitmap::save`]. Once attached to a file, every
/// mutation also lands in the mapped `IsDel` file, so deletion marks persist
/// without an explicit flush.
#[derive(Debug)]
pub struct DelBitmap {
    bits: BitVec,
    mmap: Option<MmapFileMut>,
}

impl DelBitmap {
    /// Creates an empty, detached bitmap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
            mmap: None,
        }
    }

    /// Wraps existing heap bits, detached.
    #[must_use]
    pub fn from_bits(bits: BitVec) -> Self {
        Self { bits, mmap: None }
    }

    /// Creates the `IsDel` file at `path` with zero rows and attaches it.
    pub fn create(path: &Path) -> CoreResult<Self> {
        let mut mmap = MmapFileMut::create(path, ISDEL_CHUNK)?;
        mmap.write_at(0, &0u64.to_le_bytes())?;
        Ok(Self {
            bits: BitVec::new(),
            mmap: Some(mmap),
        })
    }

    /// Loads the `IsDel` file at `path` and attaches it.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let mmap = MmapFileMut::open(path)?;
        if mmap.len() < ISDEL_HEADER {
            return Err(CoreError::corruption(format!(
                "IsDel file too short: {}",
                path.display()
            )));
        }
        let rows = u64::from_le_bytes(mmap.slice_at(0, 8)?.try_into().unwrap()) as usize;
        let bits = BitVec::from_bytes(mmap.slice_at(ISDEL_HEADER, (mmap.len() - ISDEL_HEADER) as usize)?, rows)
            .map_err(|_| {
                CoreError::corruption(format!(
                    "IsDel row count {rows} exceeds file size: {}",
                    path.display()
                ))
            })?;
        Ok(Self {
            bits,
            mmap: Some(mmap),
        })
    }

    /// Writes a detached bitmap to `path` atomically (header + packed words).
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut data = Vec::with_capacity(8 + self.bits.words.len() * 8);
        data.extend_from_slice(&(self.bits.len() as u64).to_le_bytes());
        data.extend_from_slice(&self.bits.to_bytes());
        atomic_write(path, &data)?;
        Ok(())
    }

    /// Number of rows covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Returns true when no rows are covered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns bit `i`.
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        self.bits.get(i)
    }

    /// Number of set bits.
    #[must_use]
    pub fn popcnt(&self) -> usize {
        self.bits.popcnt()
    }

    /// Borrows the bits (for snapshots).
    #[must_use]
    pub fn bits(&self) -> &BitVec {
        &self.bits
    }

    /// Sets bit `i`; returns true if it changed.
    pub fn set1(&mut self, i: usize) -> CoreResult<bool> {
        let changed = self.bits.set1(i);
        if changed {
            self.write_word(BitVec::word_of(i))?;
        }
        Ok(changed)
    }

    /// Clears bit `i`; returns true if it changed.
    pub fn set0(&mut self, i: usize) -> CoreResult<bool> {
        let changed = self.bits.set0(i);
        if changed {
            self.write_word(BitVec::word_of(i))?;
        }
        Ok(changed)
    }

    /// Sets bits `[begin, end)`.
    pub fn set_range1(&mut self, begin: usize, end: usize) -> CoreResult<()> {
        self.bits.set_range1(begin, end);
        if begin < end {
            for w in BitVec::word_of(begin)..=BitVec::word_of(end - 1) {
                self.write_word(w)?;
            }
        }
        Ok(())
    }

    /// Appends a bit, growing the backing file when the chunk is full.
    pub fn push(&mut self, value: bool) -> CoreResult<()> {
        self.bits.push(value);
        let i = self.bits.len() - 1;
        if let Some(mmap) = &mut self.mmap {
            let word_end = ISDEL_HEADER + (BitVec::word_of(i) as u64 + 1) * 8;
            if word_end > mmap.len() {
                let new_len = word_end.div_ceil(ISDEL_CHUNK) * ISDEL_CHUNK;
                mmap.grow(new_len)?;
            }
        }
        self.write_word(BitVec::word_of(i))?;
        self.write_header()?;
        Ok(())
    }

    fn write_word(&mut self, w: usize) -> CoreResult<()> {
        if let Some(mmap) = &mut self.mmap {
            mmap.write_at(ISDEL_HEADER + (w as u64) * 8, &self.bits.word(w).to_le_bytes())?;
        }
        Ok(())
    }

    fn write_header(&mut self) -> CoreResult<()> {
        if let Some(mmap) = &mut self.mmap {
            mmap.write_at(0, &(self.bits.len() as u64).to_le_bytes())?;
        }
        Ok(())
    }

    /// Flushes the mapped file, if attached.
    pub fn flush(&self) -> CoreResult<()> {
        if let Some(mmap) = &self.mmap {
            mmap.flush()?;
        }
        Ok(())
    }
}

impl Default for DelBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bitvec_push_get_popcnt() {
        let mut v = BitVec::new();
        for i in 0..130 {
            v.push(i % 3 == 0);
        }
        assert_eq!(v.len(), 130);
        assert!(v.get(0));
        assert!(!v.get(1));
        assert!(v.get(129));
        assert_eq!(v.popcnt(), (0..130).filter(|i| i % 3 == 0).count());
    }

    #[test]
    fn bitvec_set_reports_change() {
        let mut v = BitVec::with_len(10, false);
        assert!(v.set1(3));
        assert!(!v.set1(3));
        assert!(v.set0(3));
        assert!(!v.set0(3));
    }

    #[test]
    fn bitvec_bytes_roundtrip() {
        let mut v = BitVec::new();
        for i in 0..77 {
            v.push(i % 5 == 0);
        }
        let restored = BitVec::from_bytes(&v.to_bytes(), 77).unwrap();
        assert_eq!(restored, v);
    }

    #[test]
    fn rank_select_laws() {
        let mut bits = BitVec::new();
        for i in 0..300 {
            bits.push(i % 7 == 0);
        }
        let rs = RankSelect0::new(bits.clone());

        let mut zeros = 0;
        for i in 0..bits.len() {
            assert_eq!(rs.rank0(i), zeros, "rank0({i})");
            if !bits.get(i) {
                assert_eq!(rs.select0(zeros), i, "select0({zeros})");
                zeros += 1;
            }
        }
        assert_eq!(rs.max_rank0(), zeros);
        assert_eq!(rs.rank0(bits.len()), zeros);
        assert_eq!(rs.max_rank1(), bits.len() - zeros);

        // rank0 and select0 are inverse over clear positions
        for k in 0..rs.max_rank0() {
            assert_eq!(rs.rank0(rs.select0(k)), k);
        }
    }

    #[test]
    fn rank_select_all_set() {
        let rs = RankSelect0::new(BitVec::with_len(65, true));
        assert_eq!(rs.max_rank0(), 0);
        assert_eq!(rs.max_rank1(), 65);
    }

    #[test]
    fn del_bitmap_write_through_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IsDel");

        let mut del = DelBitmap::create(&path).unwrap();
        for _ in 0..100 {
            del.push(false).unwrap();
        }
        del.set1(7).unwrap();
        del.set1(42).unwrap();
        drop(del);

        let del = DelBitmap::load(&path).unwrap();
        assert_eq!(del.len(), 100);
        assert_eq!(del.popcnt(), 2);
        assert!(del.get(7));
        assert!(del.get(42));
        assert!(!del.get(8));
    }

    #[test]
    fn del_bitmap_grows_past_chunk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IsDel");

        let rows = (super::ISDEL_CHUNK as usize - 8) * 8 + 700;
        let mut del = DelBitmap::create(&path).unwrap();
        for i in 0..rows {
            del.push(i == rows - 1).unwrap();
        }
        drop(del);

        let del = DelBitmap::load(&path).unwrap();
        assert_eq!(del.len(), rows);
        assert!(del.get(rows - 1));
        assert_eq!(del.popcnt(), 1);
    }

    #[test]
    fn detached_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("IsDel");

        let mut bits = BitVec::with_len(33, false);
        bits.set1(32);
        DelBitmap::from_bits(bits).save(&path).unwrap();

        let del = DelBitmap::load(&path).unwrap();
        assert_eq!(del.len(), 33);
        assert!(del.get(32));
    }
}
