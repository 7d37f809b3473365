//! Error types for the StrataDB engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage primitive error.
    #[error("storage error: {0}")]
    Storage(#[from] stratadb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bad argument: schema problems, ids out of range, mutations against
    /// the wrong segment, missing metadata keys.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },

    /// A record id fell outside a store's row count.
    #[error("record id {id} out of range, rows={rows}")]
    OutOfRange {
        /// Requested record id.
        id: u64,
        /// Row count of the store.
        rows: u64,
    },

    /// The segment list would exceed its reserved capacity.
    #[error("too many segments: limit is {limit}")]
    TooManySegments {
        /// Configured segment limit.
        limit: usize,
    },

    /// `create` was called on a handle that already has segments.
    #[error("table already initialized: {segments} segments present")]
    AlreadyInitialized {
        /// Number of segments already loaded.
        segments: usize,
    },

    /// Another process holds the table's directory lock.
    #[error("table locked: another process has exclusive access")]
    TableLocked,

    /// On-disk state did not have the expected shape.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Internal invariant breach. Not recoverable by the caller.
    #[error("logic error: {message}")]
    Logic {
        /// Description of the broken invariant.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a logic error.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::Logic {
            message: message.into(),
        }
    }
}
