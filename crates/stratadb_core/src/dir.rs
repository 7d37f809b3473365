//! Table directory management.
//!
//! Layout of `{dir}/{name}/`:
//!
//! ```text
//! dbmeta.json      # metadata: segment counts, sizes, schema, indexes
//! LOCK             # advisory lock for single-process access
//! rd-0000/         # read-only segment directories
//! wr-0003/         # writable segment directories
//! ```
//!
//! `dbmeta.json` is written atomically (tmp + rename + dir fsync). The LOCK
//! file ensures only one process opens a table at a time.

use crate::error::{CoreError, CoreResult};
use crate::schema::{IndexDef, Schema};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use stratadb_storage::atomic_write;

const META_FILE: &str = "dbmeta.json";
const LOCK_FILE: &str = "LOCK";

/// Default writable segment size limit (3 GiB).
const DEFAULT_MAX_WR_SEG_SIZE: u64 = 3 * 1024 * 1024 * 1024;
/// Default read-only memory budget (2 GiB).
const DEFAULT_READONLY_DATA_MEM_SIZE: u64 = 2 * 1024 * 1024 * 1024;

fn default_max_wr_seg_size() -> u64 {
    DEFAULT_MAX_WR_SEG_SIZE
}

fn default_readonly_data_mem_size() -> u64 {
    DEFAULT_READONLY_DATA_MEM_SIZE
}

/// Persistent table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableMeta {
    /// Number of segments on disk.
    #[serde(rename = "TotalSegNum")]
    pub total_seg_num: usize,
    /// Segments `[0, MinWrSeg)` are read-only, the rest writable.
    #[serde(rename = "MinWrSeg")]
    pub min_wr_seg: usize,
    /// Writable segment size limit.
    #[serde(rename = "MaxWrSegSize", default = "default_max_wr_seg_size")]
    pub max_wr_seg_size: u64,
    /// Read-only data memory budget.
    #[serde(rename = "ReadonlyDataMemSize", default = "default_readonly_data_mem_size")]
    pub readonly_data_mem_size: u64,
    /// Row schema as TSV rows: `<colId>\t<colName>\t<typeTag>[\t<fixedLen>]`.
    #[serde(rename = "RowSchema")]
    pub row_schema: Vec<String>,
    /// Indexes as comma-joined column lists; a `unique:` prefix marks a
    /// unique index.
    #[serde(rename = "TableIndex")]
    pub table_index: Vec<String>,
}

impl TableMeta {
    pub(crate) fn row_schema(&self) -> CoreResult<Schema> {
        Schema::from_meta_rows("row", &self.row_schema)
    }

    pub(crate) fn index_defs(&self) -> Vec<IndexDef> {
        self.table_index
            .iter()
            .map(|entry| {
                let (unique, cols) = match entry.strip_prefix("unique:") {
                    Some(rest) => (true, rest),
                    None => (false, entry.as_str()),
                };
                let def = IndexDef::new(cols.split(','));
                if unique {
                    def.unique()
                } else {
                    def
                }
            })
            .collect()
    }

    pub(crate) fn index_entry(def: &IndexDef) -> String {
        let cols = def.columns.join(",");
        if def.unique {
            format!("unique:{cols}")
        } else {
            cols
        }
    }
}

/// Handle on a table's directory; owns the advisory lock.
#[derive(Debug)]
pub(crate) struct TableDir {
    root: PathBuf,
    _lock_file: File,
}

impl TableDir {
    /// Opens (or creates) `{dir}/{name}/` and takes the exclusive lock.
    pub(crate) fn open(dir: &Path, name: &str) -> CoreResult<Self> {
        let root = dir.join(name);
        std::fs::create_dir_all(&root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::TableLocked);
        }
        Ok(Self {
            root,
            _lock_file: lock_file,
        })
    }

    /// The table's root directory.
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of segment `idx` with the given kind prefix (`rd`/`wr`).
    pub(crate) fn seg_dir(&self, kind: &str, idx: usize) -> PathBuf {
        self.root.join(crate::segment::seg_dir_name(kind, idx))
    }

    /// Counts segment directories present on disk.
    pub(crate) fn count_seg_dirs(&self) -> CoreResult<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_dir()
                && (name.starts_with("rd-") || name.starts_with("wr-"))
                && !name.contains('.')
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Loads `dbmeta.json`, or `None` for a fresh directory.
    pub(crate) fn load_meta(&self) -> CoreResult<Option<TableMeta>> {
        let path = self.root.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        let meta = serde_json::from_slice(&data).map_err(|err| {
            CoreError::invalid_argument(format!("bad {META_FILE}: {err}"))
        })?;
        Ok(Some(meta))
    }

    /// Writes `dbmeta.json` atomically.
    pub(crate) fn save_meta(&self, meta: &TableMeta) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(meta)
            .map_err(|err| CoreError::logic(format!("meta serialization failed: {err}")))?;
        atomic_write(self.root.join(META_FILE), &data)?;
        Ok(())
    }

    /// Picks the smallest free `.backup-N` sibling for `formal`.
    pub(crate) fn backup_dir(formal: &Path) -> PathBuf {
        for n in 0.. {
            let mut os = formal.as_os_str().to_os_string();
            os.push(format!(".backup-{n}"));
            let candidate = PathBuf::from(os);
            if !candidate.exists() {
                return candidate;
            }
            tracing::error!(dir = %candidate.display(), "stale backup directory in the way");
        }
        unreachable!("some backup index is free")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnMeta, ColumnType};
    use tempfile::tempdir;

    fn meta() -> TableMeta {
        let schema = Schema::new(
            "row",
            vec![
                ColumnMeta::new("a", ColumnType::Int32),
                ColumnMeta::new("b", ColumnType::VarBinary),
            ],
        )
        .unwrap();
        TableMeta {
            total_seg_num: 3,
            min_wr_seg: 2,
            max_wr_seg_size: 1024,
            readonly_data_mem_size: 4096,
            row_schema: schema.to_meta_rows(),
            table_index: vec![TableMeta::index_entry(&IndexDef::new(["a"]).unique())],
        }
    }

    #[test]
    fn meta_roundtrip() {
        let dir = tempdir().unwrap();
        let tdir = TableDir::open(dir.path(), "t").unwrap();

        assert!(tdir.load_meta().unwrap().is_none());
        tdir.save_meta(&meta()).unwrap();

        let loaded = tdir.load_meta().unwrap().unwrap();
        assert_eq!(loaded.total_seg_num, 3);
        assert_eq!(loaded.min_wr_seg, 2);
        assert_eq!(loaded.max_wr_seg_size, 1024);
        let defs = loaded.index_defs();
        assert_eq!(defs.len(), 1);
        assert!(defs[0].unique);
        assert_eq!(defs[0].columns, vec!["a"]);
        assert_eq!(loaded.row_schema().unwrap().column_num(), 2);
    }

    #[test]
    fn missing_required_key_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let tdir = TableDir::open(dir.path(), "t").unwrap();
        std::fs::write(
            tdir.root().join(META_FILE),
            br#"{"TotalSegNum": 1, "RowSchema": [], "TableIndex": []}"#,
        )
        .unwrap();
        assert!(matches!(
            tdir.load_meta(),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn lock_excludes_second_opener() {
        let dir = tempdir().unwrap();
        let _first = TableDir::open(dir.path(), "t").unwrap();
        assert!(matches!(
            TableDir::open(dir.path(), "t"),
            Err(CoreError::TableLocked)
        ));
    }

    #[test]
    fn backup_dir_picks_free_slot() {
        let dir = tempdir().unwrap();
        let formal = dir.path().join("rd-0001");
        std::fs::create_dir(dir.path().join("rd-0001.backup-0")).unwrap();
        let backup = TableDir::backup_dir(&formal);
        assert_eq!(backup, dir.path().join("rd-0001.backup-1"));
    }
}
