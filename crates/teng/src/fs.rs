//! The filesystem collaborator.
//!
//! The engine never touches the OS directly; templates, dictionaries and
//! configurations are read through this trait so embedders can supply their
//! own storage. A freshness hash accompanies every source and drives the
//! `watchFiles` change detection.

use std::{
    cell::RefCell,
    hash::Hasher,
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::{AHashMap, AHasher};

/// Storage abstraction the engine loads sources through.
pub trait Filesystem {
    /// Returns the contents of `path`. Invalid UTF-8 is replaced.
    fn read(&self, path: &str) -> io::Result<String>;

    /// Returns a hash that stays stable while the contents and metadata of
    /// `path` are unchanged.
    fn hash(&self, path: &str) -> io::Result<u64>;
}

/// Filesystem backed by the operating system.
#[derive(Debug, Default)]
pub struct NativeFilesystem;

impl Filesystem for NativeFilesystem {
    fn read(&self, path: &str) -> io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn hash(&self, path: &str) -> io::Result<u64> {
        let meta = std::fs::metadata(path)?;
        let mut hasher = AHasher::default();
        hasher.write_u64(meta.len());
        let mtime = meta
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.write_u128(mtime);
        hasher.write(path.as_bytes());
        Ok(hasher.finish())
    }
}

/// In-memory filesystem used by tests and embedders that hold templates as
/// strings. Replacing a file's contents changes its hash.
#[derive(Debug, Default)]
pub struct InMemoryFilesystem {
    files: RefCell<AHashMap<String, String>>,
}

impl InMemoryFilesystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.borrow_mut().insert(path.into(), contents.into());
    }

    pub fn remove(&self, path: &str) {
        self.files.borrow_mut().remove(path);
    }
}

impl Filesystem for InMemoryFilesystem {
    fn read(&self, path: &str) -> io::Result<String> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))
    }

    fn hash(&self, path: &str) -> io::Result<u64> {
        let files = self.files.borrow();
        let contents = files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))?;
        let mut hasher = AHasher::default();
        hasher.write(contents.as_bytes());
        Ok(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_hash_follows_contents() {
        let fs = InMemoryFilesystem::new();
        fs.insert("a.html", "one");
        let first = fs.hash("a.html").unwrap();
        fs.insert("a.html", "two");
        let second = fs.hash("a.html").unwrap();
        assert_ne!(first, second);
        assert_eq!(fs.read("a.html").unwrap(), "two");
    }

    #[test]
    fn missing_file_is_an_error() {
        let fs = InMemoryFilesystem::new();
        assert!(fs.read("gone").is_err());
        assert!(fs.hash("gone").is_err());
    }
}
