//! Deduplicated list of loaded sources with freshness hashes.

use std::sync::Arc;

use crate::fs::Filesystem;

/// One loaded source file.
#[derive(Debug, Clone)]
struct Source {
    filename: Arc<str>,
    hash: u64,
}

/// The list of files a program or dictionary was built from.
///
/// Each file appears once; the hash recorded at load time supports the
/// `watchFiles` change detection.
#[derive(Debug, Clone, Default)]
pub struct SourceList {
    sources: Vec<Source>,
}

impl SourceList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filename`, returning its shared name and index. A file
    /// already present is not duplicated; its stored hash is kept.
    pub fn push(&mut self, fs: &dyn Filesystem, filename: &str) -> (Arc<str>, usize) {
        if let Some(idx) = self.sources.iter().position(|s| &*s.filename == filename) {
            return (Arc::clone(&self.sources[idx].filename), idx);
        }
        let hash = fs.hash(filename).unwrap_or(0);
        let filename: Arc<str> = Arc::from(filename);
        self.sources.push(Source { filename: Arc::clone(&filename), hash });
        (filename, self.sources.len() - 1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True if any source's recomputed hash differs from the stored one.
    /// A file that can no longer be hashed counts as changed.
    #[must_use]
    pub fn is_changed(&self, fs: &dyn Filesystem) -> bool {
        self.sources
            .iter()
            .any(|s| fs.hash(&s.filename).map(|h| h != s.hash).unwrap_or(true))
    }

    /// Iterates over the stored filenames.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| &*s.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFilesystem;

    #[test]
    fn push_deduplicates() {
        let fs = InMemoryFilesystem::new();
        fs.insert("x", "data");
        let mut sources = SourceList::new();
        let (_, first) = sources.push(&fs, "x");
        let (_, second) = sources.push(&fs, "x");
        assert_eq!(first, second);
        assert_eq!(sources.len(), 1);
    }

    #[test]
    fn change_detection() {
        let fs = InMemoryFilesystem::new();
        fs.insert("x", "data");
        let mut sources = SourceList::new();
        sources.push(&fs, "x");
        assert!(!sources.is_changed(&fs));
        fs.insert("x", "other");
        assert!(sources.is_changed(&fs));
        fs.remove("x");
        assert!(sources.is_changed(&fs));
    }
}
