//! LRU caches of compiled programs, dictionaries and configurations.
//!
//! Keys are vectors of normalized source keys; a filename key is the
//! normalized absolute path, an inline string key is its MD5 hex digest.
//! Every entry carries a serial (bumped when its data is replaced) and the
//! dependency serial observed at insertion; mismatching dependency serials
//! make dependents rebuild.

use std::sync::Arc;

use ahash::AHashMap;
use md5::{Digest, Md5};

/// Cache key: one normalized source key per dependency level.
pub(crate) type CacheKey = Vec<String>;

/// Normalizes a path: collapses `//`, `.` and `..` components. Purely
/// lexical, no filesystem access.
#[must_use]
pub(crate) fn normalize_filename(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Cache key for a template/dictionary/configuration file.
#[must_use]
pub(crate) fn key_for_filename(fs_root: &str, filename: &str) -> String {
    if filename.is_empty() {
        return String::new();
    }
    normalize_filename(&format!("{fs_root}/{filename}"))
}

/// Cache key for an inline template string: its MD5 hex digest.
#[must_use]
pub(crate) fn key_for_string(data: &str) -> String {
    let digest = Md5::digest(data.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[derive(Debug)]
struct Entry<D> {
    data: Arc<D>,
    serial: u64,
    depend_serial: u64,
}

/// An LRU cache with serial-based invalidation support.
#[derive(Debug)]
pub(crate) struct Cache<D> {
    entries: AHashMap<CacheKey, Entry<D>>,
    /// Keys ordered most-recently-used first.
    lru: Vec<CacheKey>,
    max_size: usize,
}

const DEFAULT_MAXIMAL_SIZE: usize = 50;

impl<D> Cache<D> {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: AHashMap::new(),
            lru: Vec::new(),
            max_size: if max_size == 0 { DEFAULT_MAXIMAL_SIZE } else { max_size },
        }
    }

    /// Looks the key up and promotes it to most-recently-used. Returns the
    /// data with its dependency serial and serial.
    pub fn find(&mut self, key: &CacheKey) -> Option<(Arc<D>, u64, u64)> {
        let entry = self.entries.get(key)?;
        let result = (Arc::clone(&entry.data), entry.depend_serial, entry.serial);
        self.hit(key);
        Some(result)
    }

    /// Inserts or replaces data under the key, returning the entry's serial.
    /// Re-adding the identical data leaves the serial unchanged; replacement
    /// increments it.
    pub fn add(&mut self, key: CacheKey, data: Arc<D>, depend_serial: u64) -> u64 {
        if let Some(entry) = self.entries.get_mut(&key) {
            if Arc::ptr_eq(&entry.data, &data) {
                let serial = entry.serial;
                self.hit(&key);
                return serial;
            }
            entry.data = data;
            entry.depend_serial = depend_serial;
            entry.serial += 1;
            let serial = entry.serial;
            self.hit(&key);
            return serial;
        }

        if self.entries.len() >= self.max_size {
            self.evict();
        }
        self.entries.insert(key.clone(), Entry { data, serial: 0, depend_serial });
        self.lru.insert(0, key);
        0
    }

    /// Moves the key to the front of the LRU order.
    fn hit(&mut self, key: &CacheKey) {
        match self.lru.iter().position(|k| k == key) {
            Some(0) => {}
            Some(idx) => {
                let entry = self.lru.remove(idx);
                self.lru.insert(0, entry);
            }
            None => self.lru.insert(0, key.clone()),
        }
    }

    /// Removes the least-recently-used entry, preferring one whose data has
    /// no external references.
    fn evict(&mut self) {
        let unused = self
            .lru
            .iter()
            .rposition(|key| self.entries.get(key).is_none_or(|e| Arc::strong_count(&e.data) <= 1));
        let idx = unused.unwrap_or(self.lru.len().saturating_sub(1));
        if idx < self.lru.len() {
            let key = self.lru.remove(idx);
            self.entries.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalize_collapses_components() {
        assert_eq!(normalize_filename("/a//b/./c"), "/a/b/c");
        assert_eq!(normalize_filename("/a/b/../c"), "/a/c");
        assert_eq!(normalize_filename("a/./b"), "a/b");
    }

    #[test]
    fn string_key_is_md5_hex() {
        // md5 of the empty string
        assert_eq!(key_for_string(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(key_for_string("x").len(), 32);
    }

    #[test]
    fn add_then_find_round_trips() {
        let mut cache: Cache<String> = Cache::new(4);
        let key = vec!["a".to_owned()];
        let data = Arc::new("data".to_owned());
        let serial = cache.add(key.clone(), Arc::clone(&data), 7);
        assert_eq!(serial, 0);
        let (found, depend, serial) = cache.find(&key).unwrap();
        assert!(Arc::ptr_eq(&found, &data));
        assert_eq!(depend, 7);
        assert_eq!(serial, 0);
    }

    #[test]
    fn replacing_data_bumps_serial_identical_does_not() {
        let mut cache: Cache<String> = Cache::new(4);
        let key = vec!["a".to_owned()];
        let data = Arc::new("one".to_owned());
        cache.add(key.clone(), Arc::clone(&data), 0);
        assert_eq!(cache.add(key.clone(), data, 0), 0);
        assert_eq!(cache.add(key.clone(), Arc::new("two".to_owned()), 0), 1);
        assert_eq!(cache.add(key, Arc::new("three".to_owned()), 0), 2);
    }

    #[test]
    fn eviction_prefers_externally_unreferenced() {
        let mut cache: Cache<String> = Cache::new(2);
        let hot_key = vec!["hot".to_owned()];
        let cold_key = vec!["cold".to_owned()];
        // `hot` is older but externally referenced; `cold` is newer and not
        let hot = Arc::new("hot".to_owned());
        cache.add(hot_key.clone(), Arc::clone(&hot), 0);
        cache.add(cold_key.clone(), Arc::new("cold".to_owned()), 0);
        cache.add(vec!["new".to_owned()], Arc::new("new".to_owned()), 0);
        assert_eq!(cache.len(), 2);
        assert!(cache.find(&hot_key).is_some());
        assert!(cache.find(&cold_key).is_none());
    }
}
