//! Per-caller scratch state.
//!
//! Read and write paths parse rows into column ranges over reusable
//! buffers; a `TableCtx` keeps those allocations alive across calls so the
//! hot paths stay allocation-free. A context belongs to one caller and one
//! table; it carries no locks.

use crate::schema::ColumnVec;

/// Reusable scratch buffers for table operations.
#[derive(Debug, Default)]
pub struct TableCtx {
    /// Record scratch (combine source, projection target).
    pub(crate) buf1: Vec<u8>,
    /// Secondary record scratch (old-row reads during replace).
    pub(crate) buf2: Vec<u8>,
    /// Parsed columns of the row being written or read.
    pub(crate) cols1: ColumnVec,
    /// Row-shaped scatter target.
    pub(crate) cols2: ColumnVec,
    /// Parsed columns of the old row during replace.
    pub(crate) cols3: ColumnVec,
    /// Index key scratch.
    pub(crate) key1: Vec<u8>,
    /// Second index key scratch (old key during replace).
    pub(crate) key2: Vec<u8>,
    /// Row-id scratch for index searches.
    pub(crate) ids: Vec<u64>,
}

impl TableCtx {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
