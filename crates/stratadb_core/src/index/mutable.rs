//! Mutable index of a writable segment.
//!
//! A B-tree multimap from key bytes to sorted sub-id posting lists. The
//! composite table mutates it under its writer lock; reads run under the
//! reader lock, so the interior lock is short and uncontended.
//!
//! The mutable index is not persisted: a writable segment rebuilds it from
//! its row store on open.

use parking_lot::RwLock;
use std::collections::BTreeMap;

/// In-memory key → sub-id multimap.
#[derive(Debug, Default)]
pub struct MutableIndex {
    unique: bool,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u32>>>,
}

impl MutableIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(unique: bool) -> Self {
        Self {
            unique,
            map: RwLock::new(BTreeMap::new()),
        }
    }

    /// Whether the schema declares this key unique.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Inserts `(key, id)`. Duplicate ids for a key are ignored; a second
    /// id under a unique key is accepted and logged, uniqueness enforcement
    /// is left to the caller.
    pub fn insert(&self, key: &[u8], id: u32) {
        let mut map = self.map.write();
        let ids = map.entry(key.to_vec()).or_default();
        if self.unique && !ids.is_empty() && !ids.contains(&id) {
            tracing::warn!(ids = ids.len(), "duplicate key inserted into a unique index");
        }
        if let Err(at) = ids.binary_search(&id) {
            ids.insert(at, id);
        }
    }

    /// Removes `(key, id)`; returns true if it was present.
    pub fn remove(&self, key: &[u8], id: u32) -> bool {
        let mut map = self.map.write();
        let Some(ids) = map.get_mut(key) else {
            return false;
        };
        let Ok(at) = ids.binary_search(&id) else {
            return false;
        };
        ids.remove(at);
        if ids.is_empty() {
            map.remove(key);
        }
        true
    }

    /// Moves `key` from `old_id` to `new_id`.
    pub fn replace(&self, key: &[u8], old_id: u32, new_id: u32) {
        self.remove(key, old_id);
        self.insert(key, new_id);
    }

    /// Appends the sub-ids holding exactly `key` to `out`.
    pub fn search_exact_append(&self, key: &[u8], out: &mut Vec<u64>) {
        let map = self.map.read();
        if let Some(ids) = map.get(key) {
            out.extend(ids.iter().map(|&id| u64::from(id)));
        }
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.map.read().len()
    }

    /// Approximate heap footprint.
    #[must_use]
    pub fn storage_size(&self) -> u64 {
        let map = self.map.read();
        map.iter()
            .map(|(k, ids)| k.len() + ids.len() * 4 + 32)
            .sum::<usize>() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_search_remove() {
        let idx = MutableIndex::new(false);
        idx.insert(b"k", 5);
        idx.insert(b"k", 1);
        idx.insert(b"k", 5); // duplicate id ignored
        idx.insert(b"other", 9);

        let mut out = Vec::new();
        idx.search_exact_append(b"k", &mut out);
        assert_eq!(out, vec![1, 5]);

        assert!(idx.remove(b"k", 1));
        assert!(!idx.remove(b"k", 1));
        out.clear();
        idx.search_exact_append(b"k", &mut out);
        assert_eq!(out, vec![5]);
    }

    #[test]
    fn empty_posting_drops_the_key() {
        let idx = MutableIndex::new(false);
        idx.insert(b"k", 1);
        idx.remove(b"k", 1);
        assert_eq!(idx.num_keys(), 0);
    }

    #[test]
    fn replace_moves_id() {
        let idx = MutableIndex::new(true);
        idx.insert(b"k", 2);
        idx.replace(b"k", 2, 7);

        let mut out = Vec::new();
        idx.search_exact_append(b"k", &mut out);
        assert_eq!(out, vec![7]);
    }
}
