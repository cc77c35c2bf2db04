//! Local filesystem cache backend.
//!
//! The simplest backend: artifacts live as files under a root directory
//! that mirrors the cache key layout (`<root>/v7/<name>:<tag>:<platform>
//! .tar.gz`). Writes stream to a `.tmp-<pid>` sibling and are renamed into
//! place so that concurrent pybuild-cache processes sharing the directory
//! never observe a partially written artifact.

use crate::cache::{write_atomically, Backend};
use crate::error::{Error, Result};
use anyhow::Context;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem-backed cache backend.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Checked before any remote backend.
    pub const PRIORITY: u32 = 10;

    /// Create a backend rooted at `root`. The directory is created lazily
    /// on the first `put`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBackend { root: root.into() }
    }

    /// Absolute pathname a cache filename maps to under this backend.
    pub fn pathname(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}

impl Backend for LocalBackend {
    fn label(&self) -> &str {
        "local"
    }

    fn priority(&self) -> u32 {
        Self::PRIORITY
    }

    fn get(&mut self, filename: &str) -> Result<Option<PathBuf>> {
        let pathname = self.pathname(filename);
        if pathname.is_file() {
            debug!(pathname = %pathname.display(), "artifact exists in local cache");
            Ok(Some(pathname))
        } else {
            debug!(pathname = %pathname.display(), "artifact not in local cache");
            Ok(None)
        }
    }

    fn put(&mut self, filename: &str, source: &Path) -> Result<()> {
        let pathname = self.pathname(filename);
        let mut reader = File::open(source)
            .with_context(|| format!("opening artifact '{}'", source.display()))
            .map_err(Error::BackendFailure)?;
        write_atomically(&pathname, &mut reader).map_err(Error::BackendFailure)?;
        debug!(pathname = %pathname.display(), "cached artifact in local cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FILENAME: &str = "v7/pkg:1.0:py3.11.tar.gz";

    #[test]
    fn get_misses_then_hits_after_put() {
        let tmp = TempDir::new().unwrap();
        let mut backend = LocalBackend::new(tmp.path().join("binaries"));
        assert_eq!(backend.get(FILENAME).unwrap(), None);

        let source = tmp.path().join("built.tar.gz");
        fs::write(&source, b"tar bytes").unwrap();
        backend.put(FILENAME, &source).unwrap();

        let hit = backend.get(FILENAME).unwrap().expect("hit after put");
        assert!(hit.is_absolute() || hit.starts_with(tmp.path()));
        assert_eq!(fs::read(hit).unwrap(), b"tar bytes");
    }

    #[test]
    fn put_overwrites_previous_artifact() {
        let tmp = TempDir::new().unwrap();
        let mut backend = LocalBackend::new(tmp.path().join("binaries"));

        let first = tmp.path().join("first.tar.gz");
        let second = tmp.path().join("second.tar.gz");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        backend.put(FILENAME, &first).unwrap();
        backend.put(FILENAME, &second).unwrap();

        let hit = backend.get(FILENAME).unwrap().unwrap();
        assert_eq!(fs::read(hit).unwrap(), b"second");
    }

    #[test]
    fn put_of_missing_source_is_a_backend_failure() {
        let tmp = TempDir::new().unwrap();
        let mut backend = LocalBackend::new(tmp.path().join("binaries"));
        let missing = tmp.path().join("never-built.tar.gz");
        let err = backend.put(FILENAME, &missing).unwrap_err();
        assert!(matches!(err, Error::BackendFailure(_)));
    }
}
