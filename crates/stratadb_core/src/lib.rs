//! # StrataDB core
//!
//! A segmented, column-group storage engine. A [`Table`] presents one
//! monotonically numbered row space over an ordered list of segments: many
//! immutable compressed read-only segments plus a single writable tail that
//! absorbs all inserts. Background migration keeps the table dense:
//! [`Table::compact`] converts frozen writable segments into compressed
//! read-only ones without blocking readers, and
//! [`Table::purge_deleted_rows`] rebuilds a read-only segment without its
//! deleted rows.
//!
//! ```ignore
//! use stratadb_core::{ColumnMeta, ColumnType, IndexDef, Schema, Table, TableConfig};
//!
//! let schema = Schema::new("row", vec![
//!     ColumnMeta::new("a", ColumnType::Int32),
//!     ColumnMeta::new("b", ColumnType::VarBinary),
//! ])?;
//! let table = Table::create(dir, "events", schema, &[IndexDef::new(["a"])],
//!                           TableConfig::default())?;
//! let mut ctx = table.new_ctx();
//! let id = table.insert_row(&row_bytes, true, &mut ctx)?;
//! ```
//!
//! Concurrency: one upgradable reader/writer lock per table orders
//! structural changes; each segment adds a short lock over its deletion
//! bitmap. Converts and purges synchronize racing updates with a
//! journal drained three times around the final writer-lock swap.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bitmap;
mod config;
mod context;
mod dir;
mod error;
pub mod index;
pub mod schema;
pub mod segment;
pub mod store;
mod table;

pub use config::TableConfig;
pub use context::TableCtx;
pub use error::{CoreError, CoreResult};
pub use schema::{ColumnMeta, ColumnType, IndexDef, Schema};
pub use table::{SegmentStat, Table, TableIter};
