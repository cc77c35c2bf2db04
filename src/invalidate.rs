//! Cache invalidation policies.
//!
//! A cached artifact must be rebuilt when the source it was built from has
//! changed. Two mutually exclusive policies decide that, selected once per
//! deployment through configuration:
//!
//! - **modification times**: the artifact is stale when any related source
//!   archive is newer than the artifact file. Cheap, but trusts mtimes, which is
//!   wrong on filesystems or workflows that preserve them.
//! - **checksums**: a sidecar file `<artifact>.txt` records the SHA1 of the
//!   source archives at `put()` time; staleness is a digest mismatch. A
//!   missing sidecar means "no information", not an error, and reads as
//!   fresh.

use anyhow::{Context, Result as AnyResult};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::requirement::Requirement;

/// The rule deciding whether a cached artifact must be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationPolicy {
    /// Compare source archive mtimes against the artifact mtime.
    ModificationTimes,
    /// Compare a recorded SHA1 sidecar against the current source digest.
    Checksums,
}

impl InvalidationPolicy {
    /// Select the policy for a configuration: trusted mtimes use the cheap
    /// comparison, everything else pays for checksums.
    pub fn for_trust_mod_times(trust_mod_times: bool) -> Self {
        if trust_mod_times {
            InvalidationPolicy::ModificationTimes
        } else {
            InvalidationPolicy::Checksums
        }
    }

    /// Whether the cached `artifact` is stale with respect to
    /// `requirement`'s source archives.
    pub fn is_stale(&self, requirement: &Requirement, artifact: &Path) -> Result<bool> {
        let stale = match self {
            InvalidationPolicy::ModificationTimes => {
                let artifact_mtime = artifact
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .with_context(|| format!("reading mtime of '{}'", artifact.display()))?;
                requirement.last_modified()? > artifact_mtime
            }
            InvalidationPolicy::Checksums => match recall_checksum(artifact)? {
                Some(recorded) => recorded != requirement.checksum()?,
                None => false,
            },
        };
        debug!(%requirement, artifact = %artifact.display(), stale, "checked cached artifact");
        Ok(stale)
    }

    /// Record the information `is_stale` will need later. Only the checksum
    /// policy persists anything.
    pub fn record(&self, requirement: &Requirement, artifact: &Path) -> Result<()> {
        if let InvalidationPolicy::Checksums = self {
            let sidecar = sidecar_path(artifact);
            let digest = requirement.checksum()?;
            write_sidecar(&sidecar, &digest)
                .with_context(|| format!("writing checksum sidecar '{}'", sidecar.display()))?;
            debug!(sidecar = %sidecar.display(), "recorded source checksum");
        }
        Ok(())
    }
}

/// `<artifact>.txt`, next to the artifact in the local cache.
fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut pathname = artifact.as_os_str().to_os_string();
    pathname.push(".txt");
    PathBuf::from(pathname)
}

/// The digest recorded at `put()` time, or `None` when no sidecar exists
/// (another process may not have written it yet).
fn recall_checksum(artifact: &Path) -> AnyResult<Option<String>> {
    match fs::read_to_string(sidecar_path(artifact)) {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error).with_context(|| {
            format!("reading checksum sidecar of '{}'", artifact.display())
        }),
    }
}

/// Sidecar writes go through the same tmp+rename protocol as artifact
/// writes so concurrent readers never see a torn digest.
fn write_sidecar(sidecar: &Path, digest: &str) -> AnyResult<()> {
    crate::cache::write_atomically(sidecar, &mut format!("{digest}\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Requirement, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let source_archive = tmp.path().join("pkg-1.0.tar.gz");
        fs::write(&source_archive, b"source bytes").unwrap();

        let artifact = tmp.path().join("v7/pkg:1.0:py3.11.tar.gz");
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"artifact bytes").unwrap();

        let mut requirement = Requirement::new("pkg", "1.0", tmp.path());
        requirement.related_archives = vec![source_archive];
        (tmp, requirement, artifact)
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn untouched_source_is_fresh_in_both_modes() {
        let (_tmp, requirement, artifact) = fixture();
        // Source predates the artifact.
        set_mtime(
            &requirement.related_archives[0],
            SystemTime::now() - Duration::from_secs(3600),
        );

        let mtimes = InvalidationPolicy::ModificationTimes;
        assert!(!mtimes.is_stale(&requirement, &artifact).unwrap());

        let checksums = InvalidationPolicy::Checksums;
        checksums.record(&requirement, &artifact).unwrap();
        assert!(!checksums.is_stale(&requirement, &artifact).unwrap());
    }

    #[test]
    fn newer_source_archive_is_stale_in_mtime_mode() {
        let (_tmp, requirement, artifact) = fixture();
        set_mtime(
            &requirement.related_archives[0],
            SystemTime::now() + Duration::from_secs(3600),
        );
        let policy = InvalidationPolicy::ModificationTimes;
        assert!(policy.is_stale(&requirement, &artifact).unwrap());
    }

    #[test]
    fn changed_bytes_are_stale_in_checksum_mode_even_with_old_mtime() {
        let (_tmp, requirement, artifact) = fixture();
        let policy = InvalidationPolicy::Checksums;
        policy.record(&requirement, &artifact).unwrap();

        // Rewrite the source archive, then force its mtime back into the
        // past: only the contents changed.
        let source = requirement.related_archives[0].clone();
        fs::write(&source, b"different source bytes").unwrap();
        set_mtime(&source, SystemTime::now() - Duration::from_secs(3600));

        assert!(policy.is_stale(&requirement, &artifact).unwrap());
        assert!(!InvalidationPolicy::ModificationTimes
            .is_stale(&requirement, &artifact)
            .unwrap());
    }

    #[test]
    fn missing_sidecar_reads_as_fresh() {
        let (_tmp, requirement, artifact) = fixture();
        let policy = InvalidationPolicy::Checksums;
        assert!(!policy.is_stale(&requirement, &artifact).unwrap());
    }

    #[test]
    fn sidecar_is_one_hex_digest_line() {
        let (_tmp, requirement, artifact) = fixture();
        InvalidationPolicy::Checksums
            .record(&requirement, &artifact)
            .unwrap();

        let sidecar = sidecar_path(&artifact);
        assert!(sidecar.to_string_lossy().ends_with(".tar.gz.txt"));
        let contents = fs::read_to_string(&sidecar).unwrap();
        let digest = contents.trim();
        assert_eq!(digest.len(), 40);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn policy_selection_follows_configuration() {
        assert_eq!(
            InvalidationPolicy::for_trust_mod_times(true),
            InvalidationPolicy::ModificationTimes
        );
        assert_eq!(
            InvalidationPolicy::for_trust_mod_times(false),
            InvalidationPolicy::Checksums
        );
    }
}
