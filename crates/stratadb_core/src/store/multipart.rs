//! Logical concatenation of several sub-stores.
//!
//! When convert or purge chunks a colgroup by the compression memory budget,
//! each chunk becomes its own store and the colgroup is served by a
//! `MultiPartStore`. Physical ids are partitioned across the parts in
//! order. On disk the parts are numbered shards
//! (`colgroup-<name>.NNNN.<ext>`); the whole never has a file of its own.

use crate::error::{CoreError, CoreResult};
use crate::store::{check_row, ReadableStore};
use std::path::Path;
use std::sync::Arc;

/// Store formed by concatenating sub-stores.
pub struct MultiPartStore {
    parts: Vec<Arc<dyn ReadableStore>>,
    // row_base[i] = rows in parts [0..i); len = parts.len() + 1
    row_base: Vec<u64>,
}

impl MultiPartStore {
    /// Builds from the given parts, in order.
    #[must_use]
    pub fn new(parts: Vec<Arc<dyn ReadableStore>>) -> Self {
        let mut row_base = Vec::with_capacity(parts.len() + 1);
        let mut acc = 0u64;
        row_base.push(0);
        for part in &parts {
            acc += part.num_rows();
            row_base.push(acc);
        }
        Self { parts, row_base }
    }

    /// Number of parts.
    #[must_use]
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Returns part `i`.
    #[must_use]
    pub fn part(&self, i: usize) -> &Arc<dyn ReadableStore> {
        &self.parts[i]
    }

    /// Writes each part as `<base>.NNNN.<ext>` inside `dir`.
    pub fn save_parts(&self, dir: &Path, base: &str) -> CoreResult<()> {
        for (i, part) in self.parts.iter().enumerate() {
            let name = format!("{base}.{i:04}.{}", part.file_ext());
            part.save(&dir.join(name))?;
        }
        Ok(())
    }
}

impl ReadableStore for MultiPartStore {
    fn num_rows(&self) -> u64 {
        *self.row_base.last().unwrap_or(&0)
    }

    fn data_storage_size(&self) -> u64 {
        self.parts.iter().map(|p| p.data_storage_size()).sum()
    }

    fn data_inflate_size(&self) -> u64 {
        self.parts.iter().map(|p| p.data_inflate_size()).sum()
    }

    fn get_value_append(&self, id: u64, out: &mut Vec<u8>) -> CoreResult<()> {
        check_row(id, self.num_rows())?;
        let p = self.row_base.partition_point(|&b| b <= id) - 1;
        self.parts[p].get_value_append(id - self.row_base[p], out)
    }

    fn save(&self, _path: &Path) -> CoreResult<()> {
        Err(CoreError::logic(
            "multi-part stores are saved shard by shard with save_parts",
        ))
    }

    fn file_ext(&self) -> &'static str {
        "multi"
    }

    fn as_multipart(&self) -> Option<&MultiPartStore> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{build_store, SortableStrVec};
    use crate::schema::{ColumnMeta, ColumnType, Schema};

    fn chunk(range: std::ops::Range<u32>) -> Arc<dyn ReadableStore> {
        let schema = Schema::new("v", vec![ColumnMeta::new("v", ColumnType::VarBinary)]).unwrap();
        let mut data = SortableStrVec::new();
        for i in range {
            data.push(format!("row-{i}").as_bytes());
        }
        build_store(&schema, &data).unwrap()
    }

    #[test]
    fn routes_ids_across_parts() {
        let store = MultiPartStore::new(vec![chunk(0..10), chunk(10..15), chunk(15..40)]);
        assert_eq!(store.num_rows(), 40);
        assert_eq!(store.num_parts(), 3);

        let mut out = Vec::new();
        for i in [0u64, 9, 10, 14, 15, 39] {
            store.get_value(i, &mut out).unwrap();
            assert_eq!(out, format!("row-{i}").as_bytes());
        }
        assert!(store.get_value(40, &mut out).is_err());
    }

    #[test]
    fn save_parts_numbers_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = MultiPartStore::new(vec![chunk(0..3), chunk(3..6)]);
        store.save_parts(dir.path(), "colgroup-rest").unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["colgroup-rest.0000.zblob", "colgroup-rest.0001.zblob"]);
    }
}
