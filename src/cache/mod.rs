//! Merged artifact cache over prioritized storage backends.
//!
//! Backends implement the small [`Backend`] trait and are merged by
//! [`ArtifactCache`] into one logical cache. The merge layer owns failure
//! isolation: a backend that reports missing configuration is dropped
//! quietly, a backend that fails is logged and dropped, and in both cases
//! the operation carries on with whatever backends remain. Backend problems
//! therefore never escape `get()`/`put()`; the worst case is a cache miss.
//!
//! Disablement is permanent for the process. A fresh process re-probes
//! every configured backend.

pub mod local;
pub mod remote;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::requirement::{normalize_name, Requirement};
use anyhow::Context;
use sha1::{Digest, Sha1};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Revision of the cache format. Bumped on incompatible changes so that
/// old and new caches coexist in separate `v<N>/` subdirectories.
pub const CACHE_FORMAT_REVISION: u32 = 7;

/// A pluggable artifact storage provider.
///
/// Implementations take `&mut self` because backends carry process-local
/// state (lazily opened connections, an auto-entered read-only mode).
pub trait Backend {
    /// Short name used in log messages.
    fn label(&self) -> &str;

    /// Query order: lower priorities are checked first.
    fn priority(&self) -> u32;

    /// Look up a cached artifact. `Ok(None)` is a plain miss. A
    /// [`Error::BackendDisabled`] means the backend lacks configuration;
    /// any other error disables the backend for the process.
    fn get(&mut self, filename: &str) -> Result<Option<PathBuf>>;

    /// Store the archive at `source` under `filename`. Each backend opens
    /// the file independently, so every backend reads it from the start.
    fn put(&mut self, filename: &str, source: &Path) -> Result<()>;
}

/// Compute the cache filename for a requirement:
/// `v<REV>/<name>:<tag>:<platform>.tar.gz`.
///
/// `<tag>` is the plain version unless the requirement carries a
/// distinguishing URL, in which case it is the SHA1 of version + URL so
/// that different sources claiming the same version do not collide.
/// `file://` URLs are exempt: they typically point at per-run temporary
/// directories and would defeat the cache entirely.
pub fn archive_filename(requirement: &Requirement, platform_tag: &str) -> String {
    let url = requirement
        .url
        .as_deref()
        .filter(|url| !url.starts_with("file://"));
    let tag = match url {
        Some(url) => {
            let mut hasher = Sha1::new();
            hasher.update(requirement.version.as_bytes());
            hasher.update(url.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        None => requirement.version.clone(),
    };
    format!(
        "v{CACHE_FORMAT_REVISION}/{}:{tag}:{platform_tag}.tar.gz",
        normalize_name(&requirement.name)
    )
}

/// Write `reader` to `dest` atomically: stream into `<dest>.tmp-<pid>` and
/// rename into place. Concurrent readers observe either nothing or a
/// complete file; concurrent writers converge on whichever rename lands
/// last.
pub(crate) fn write_atomically(dest: &Path, reader: &mut dyn Read) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating cache directory '{}'", parent.display()))?;
    }
    let mut tmp = dest.as_os_str().to_os_string();
    tmp.push(format!(".tmp-{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    let result = (|| -> anyhow::Result<()> {
        let mut out = fs::File::create(&tmp)
            .with_context(|| format!("creating temporary file '{}'", tmp.display()))?;
        io::copy(reader, &mut out)
            .with_context(|| format!("writing temporary file '{}'", tmp.display()))?;
        fs::rename(&tmp, dest).with_context(|| {
            format!("moving '{}' into place at '{}'", tmp.display(), dest.display())
        })?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// The default backend set for a configuration: the local filesystem cache
/// plus, when configured, the remote object store. Explicit construction:
/// no registries, no import-order surprises.
pub fn default_backends(config: &Config) -> Vec<Box<dyn Backend>> {
    vec![
        Box::new(LocalBackend::new(config.binary_cache.clone())),
        Box::new(RemoteBackend::new(
            config.remote.clone(),
            config.binary_cache.clone(),
        )),
    ]
}

/// Interface that treats multiple cache backends as a single one.
pub struct ArtifactCache {
    backends: Vec<Box<dyn Backend>>,
    platform_tag: String,
}

impl ArtifactCache {
    /// Build a cache over the default backends for `config`.
    pub fn new(config: &Config) -> Self {
        Self::with_backends(default_backends(config), config.platform_tag.clone())
    }

    /// Build a cache over an explicit backend list.
    pub fn with_backends(mut backends: Vec<Box<dyn Backend>>, platform_tag: String) -> Self {
        backends.sort_by_key(|backend| backend.priority());
        ArtifactCache {
            backends,
            platform_tag,
        }
    }

    /// The cache filename used for a requirement.
    pub fn filename(&self, requirement: &Requirement) -> String {
        archive_filename(requirement, &self.platform_tag)
    }

    /// Number of backends still live.
    pub fn live_backends(&self) -> usize {
        self.backends.len()
    }

    /// Fetch an artifact from the first backend that has it. Backends that
    /// error out are dropped and the search continues; an exhausted backend
    /// list is a miss, never an error.
    pub fn get(&mut self, requirement: &Requirement) -> Option<PathBuf> {
        let filename = self.filename(requirement);
        let mut index = 0;
        while index < self.backends.len() {
            match self.backends[index].get(&filename) {
                Ok(Some(pathname)) => {
                    debug!(backend = self.backends[index].label(), %filename, "cache hit");
                    return Some(pathname);
                }
                Ok(None) => index += 1,
                Err(reason) => self.disable(index, &reason),
            }
        }
        None
    }

    /// Store an artifact in every live backend. Failed backends are dropped
    /// mid-flight; the remaining backends still receive the archive so a
    /// partial write-through set keeps serving subsequent reads.
    pub fn put(&mut self, requirement: &Requirement, archive: &Path) {
        let filename = self.filename(requirement);
        let mut index = 0;
        while index < self.backends.len() {
            match self.backends[index].put(&filename, archive) {
                Ok(()) => index += 1,
                Err(reason) => self.disable(index, &reason),
            }
        }
    }

    /// Drop the backend at `index` for the remainder of the process.
    /// Missing configuration is expected and logged quietly; anything else
    /// is a real failure.
    fn disable(&mut self, index: usize, reason: &Error) {
        let label = self.backends[index].label().to_string();
        match reason {
            Error::BackendDisabled { reason } => {
                debug!(backend = %label, %reason, "disabling backend (requires configuration)");
            }
            other => {
                error!(backend = %label, error = %format!("{other:#}"), "disabling backend after failure");
            }
        }
        self.backends.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn requirement() -> Requirement {
        Requirement::new("Sample_Package", "1.2", "/tmp/sample")
    }

    #[test]
    fn filename_uses_plain_version_without_url() {
        let filename = archive_filename(&requirement(), "py3.11");
        assert_eq!(filename, "v7/sample-package:1.2:py3.11.tar.gz");
    }

    #[test]
    fn filename_hashes_distinguishing_urls() {
        let mut with_url = requirement();
        with_url.url = Some("https://example.com/forks/sample.tar.gz".into());
        let hashed = archive_filename(&with_url, "py3.11");
        assert_ne!(hashed, archive_filename(&requirement(), "py3.11"));

        // The tag is a 40 character hex digest.
        let tag = hashed.split(':').nth(1).unwrap();
        assert_eq!(tag.len(), 40);
        assert!(tag.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn file_urls_do_not_perturb_the_key() {
        let mut with_file_url = requirement();
        with_file_url.url = Some("file:///tmp/pip-build-abc123/sample".into());
        assert_eq!(
            archive_filename(&with_file_url, "py3.11"),
            archive_filename(&requirement(), "py3.11")
        );
    }

    /// Scripted backend for exercising the failure isolation rules.
    struct ScriptedBackend {
        label: &'static str,
        priority: u32,
        on_get: fn() -> Result<Option<PathBuf>>,
        on_put: fn() -> Result<()>,
        calls: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Backend for ScriptedBackend {
        fn label(&self) -> &str {
            self.label
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        fn get(&mut self, _filename: &str) -> Result<Option<PathBuf>> {
            self.calls.borrow_mut().push(self.label);
            (self.on_get)()
        }
        fn put(&mut self, _filename: &str, _source: &Path) -> Result<()> {
            self.calls.borrow_mut().push(self.label);
            (self.on_put)()
        }
    }

    fn scripted(
        label: &'static str,
        priority: u32,
        on_get: fn() -> Result<Option<PathBuf>>,
        on_put: fn() -> Result<()>,
        calls: &Rc<RefCell<Vec<&'static str>>>,
    ) -> Box<dyn Backend> {
        Box::new(ScriptedBackend {
            label,
            priority,
            on_get,
            on_put,
            calls: Rc::clone(calls),
        })
    }

    #[test]
    fn failing_backend_is_never_invoked_again() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut cache = ArtifactCache::with_backends(
            vec![
                scripted(
                    "broken",
                    10,
                    || Ok(None),
                    || Err(Error::BackendFailure(anyhow!("disk on fire"))),
                    &calls,
                ),
                scripted("good", 20, || Ok(None), || Ok(()), &calls),
            ],
            "py3.11".into(),
        );

        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("artifact.tar.gz");
        fs::write(&archive, b"artifact").unwrap();

        cache.put(&requirement(), &archive);
        cache.put(&requirement(), &archive);
        let mut other = requirement();
        other.name = "other".into();
        cache.put(&other, &archive);

        // One failing call, then only the good backend, once per put().
        assert_eq!(
            *calls.borrow(),
            vec!["broken", "good", "good", "good"]
        );
        assert_eq!(cache.live_backends(), 1);
    }

    #[test]
    fn disabled_backend_is_removed_silently_on_get() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut cache = ArtifactCache::with_backends(
            vec![
                scripted(
                    "unconfigured",
                    10,
                    || {
                        Err(Error::BackendDisabled {
                            reason: "no bucket".into(),
                        })
                    },
                    || Ok(()),
                    &calls,
                ),
                scripted("hit", 20, || Ok(Some(PathBuf::from("/cache/x"))), || Ok(()), &calls),
            ],
            "py3.11".into(),
        );

        assert_eq!(cache.get(&requirement()), Some(PathBuf::from("/cache/x")));
        assert_eq!(cache.live_backends(), 1);

        // A later get no longer touches the unconfigured backend.
        calls.borrow_mut().clear();
        cache.get(&requirement());
        assert_eq!(*calls.borrow(), vec!["hit"]);
    }

    #[test]
    fn all_backends_failing_is_a_miss_not_an_error() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut cache = ArtifactCache::with_backends(
            vec![scripted(
                "broken",
                10,
                || Err(Error::BackendFailure(anyhow!("boom"))),
                || Ok(()),
                &calls,
            )],
            "py3.11".into(),
        );
        assert_eq!(cache.get(&requirement()), None);
        assert_eq!(cache.live_backends(), 0);
    }

    #[test]
    fn backends_are_queried_in_priority_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        // Registered out of order on purpose.
        let mut cache = ArtifactCache::with_backends(
            vec![
                scripted("second", 20, || Ok(Some(PathBuf::from("/remote"))), || Ok(()), &calls),
                scripted("first", 10, || Ok(None), || Ok(()), &calls),
            ],
            "py3.11".into(),
        );
        assert_eq!(cache.get(&requirement()), Some(PathBuf::from("/remote")));
        assert_eq!(*calls.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn write_atomically_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("v7/pkg:1.0:py3.tar.gz");
        write_atomically(&dest, &mut &b"payload"[..]).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        let residue: Vec<_> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(residue.is_empty());
    }
}
