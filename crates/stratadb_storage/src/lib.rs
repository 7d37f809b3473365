//! # StrataDB storage primitives
//!
//! Low-level file machinery shared by the engine:
//! - memory-mapped files, read-only and growable read-write
//! - atomic write-then-rename with directory fsync
//!
//! This crate owns all `unsafe` in the workspace (the mmap calls); the
//! engine crate builds on the safe wrappers exported here.

#![warn(missing_docs)]

mod error;
mod file;
mod mmap;

pub use error::{StorageError, StorageResult};
pub use file::{atomic_rename, atomic_write, read_all, sync_dir, tmp_sibling};
pub use mmap::{MmapFile, MmapFileMut};
