//! Error types for the storage primitives.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in low-level file operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read or write fell outside the mapped region.
    #[error("out of range: offset {offset} + len {len} > size {size}")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Current file size.
        size: u64,
    },

    /// A file did not have the expected shape.
    #[error("corrupt file {path}: {message}")]
    Corrupt {
        /// Path of the offending file.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },
}

impl StorageError {
    /// Creates a corrupt-file error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }
}
