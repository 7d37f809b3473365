//! Atomic file helpers.
//!
//! Every durable file in a table is written as `<name>.tmp` and renamed over
//! the formal name, with a directory fsync after the rename so the metadata
//! update survives a crash.

use crate::error::StorageResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Writes `data` to `path` atomically: tmp file, fsync, rename, dir fsync.
pub fn atomic_write(path: impl AsRef<Path>, data: &[u8]) -> StorageResult<()> {
    let path = path.as_ref();
    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Returns the `.tmp` sibling path for `path`.
pub fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    os.into()
}

/// Fsyncs a directory so entry creations/renames/removals are durable.
///
/// On non-Unix platforms directory handles cannot be synced; the filesystem
/// journal is relied on instead.
#[cfg(unix)]
pub fn sync_dir(dir: impl AsRef<Path>) -> StorageResult<()> {
    let file = File::open(dir.as_ref())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: impl AsRef<Path>) -> StorageResult<()> {
    Ok(())
}

/// Renames `from` to `to` and fsyncs the parent directory.
pub fn atomic_rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> StorageResult<()> {
    let to = to.as_ref();
    fs::rename(from.as_ref(), to)?;
    if let Some(parent) = to.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Reads a whole file into memory.
pub fn read_all(path: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
    Ok(fs::read(path.as_ref())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");

        atomic_write(&path, b"one").unwrap();
        assert_eq!(read_all(&path).unwrap(), b"one");

        atomic_write(&path, b"two").unwrap();
        assert_eq!(read_all(&path).unwrap(), b"two");
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn atomic_rename_moves_directory() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("seg.tmp");
        let dst = dir.path().join("seg");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("f"), b"x").unwrap();

        atomic_rename(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(read_all(dst.join("f")).unwrap(), b"x");
    }
}
