//! Remote object-store cache backend.
//!
//! Talks plain HTTP to an S3-compatible object store: `GET
//! <endpoint>/<bucket>/<key>` to fetch, `PUT` to store. Downloads land in
//! the local cache directory (warming the local tier) via the same atomic
//! tmp+rename protocol the local backend uses, so a remote hit turns into
//! a local file before the caller sees it.
//!
//! Failure containment rules:
//! - missing endpoint/bucket configuration → [`Error::BackendDisabled`]
//!   (expected, the merge layer skips this backend quietly);
//! - download/connection problems → [`Error::BackendFailure`] (the merge
//!   layer disables the backend for the process);
//! - a failed upload flips this backend into read-only mode instead of
//!   disabling it: it keeps serving `get()` but stops attempting `put()`.
//!
//! Unlike the local backend, a reader racing an uploader may observe a
//! partially uploaded object. Accepted limitation.

use crate::cache::{write_atomically, Backend};
use crate::config::RemoteCacheConfig;
use crate::error::{Error, Result};
use anyhow::{anyhow, Context};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// S3-compatible HTTP object-store backend.
pub struct RemoteBackend {
    config: RemoteCacheConfig,
    local_root: PathBuf,
    agent: Option<ureq::Agent>,
    bucket_ensured: bool,
    readonly: bool,
}

impl RemoteBackend {
    /// Checked after the local backend.
    pub const PRIORITY: u32 = 20;

    /// Create a backend for `config`, downloading hits into `local_root`.
    pub fn new(config: RemoteCacheConfig, local_root: impl Into<PathBuf>) -> Self {
        RemoteBackend {
            readonly: config.readonly,
            config,
            local_root: local_root.into(),
            agent: None,
            bucket_ensured: false,
        }
    }

    /// Whether this backend is currently refusing uploads (configured, or
    /// auto-entered after a failed upload).
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// The object key for a cache filename: optional prefix + `/` + filename.
    fn object_key(&self, filename: &str) -> String {
        match self.config.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{filename}"),
            _ => filename.to_string(),
        }
    }

    /// Base URL of the bucket, or [`Error::BackendDisabled`] when the
    /// backend has not been configured.
    fn bucket_url(&self) -> Result<String> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::BackendDisabled {
                reason: "PYBUILD_REMOTE_ENDPOINT is not set".into(),
            })?;
        let bucket = self
            .config
            .bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::BackendDisabled {
                reason: "PYBUILD_REMOTE_BUCKET is not set".into(),
            })?;
        Ok(format!("{endpoint}/{bucket}"))
    }

    /// The connection is opened lazily and reused for the instance's
    /// lifetime.
    fn agent(&mut self) -> ureq::Agent {
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        self.agent
            .get_or_insert_with(|| ureq::AgentBuilder::new().timeout(timeout).build())
            .clone()
    }

    /// Opt-in bucket auto-creation, attempted at most once per instance.
    /// An already-existing bucket (409) is fine.
    fn ensure_bucket(&mut self) -> Result<()> {
        if !self.config.create_bucket || self.bucket_ensured {
            return Ok(());
        }
        let url = format!("{}/", self.bucket_url()?);
        let agent = self.agent();
        match agent.put(&url).call() {
            Ok(_) | Err(ureq::Error::Status(409, _)) => {
                self.bucket_ensured = true;
                Ok(())
            }
            Err(error) => Err(Error::BackendFailure(
                anyhow!(error).context(format!("creating bucket at '{url}'")),
            )),
        }
    }
}

impl Backend for RemoteBackend {
    fn label(&self) -> &str {
        "remote"
    }

    fn priority(&self) -> u32 {
        Self::PRIORITY
    }

    fn get(&mut self, filename: &str) -> Result<Option<PathBuf>> {
        let url = format!("{}/{}", self.bucket_url()?, self.object_key(filename));
        self.ensure_bucket()?;
        let agent = self.agent();
        debug!(%url, "checking remote cache");
        match agent.get(&url).call() {
            Ok(response) => {
                // Warm the local tier so subsequent runs never leave disk.
                let local_file = self.local_root.join(filename);
                write_atomically(&local_file, &mut response.into_reader())
                    .with_context(|| format!("downloading '{url}'"))
                    .map_err(Error::BackendFailure)?;
                info!(pathname = %local_file.display(), "downloaded artifact from remote cache");
                Ok(Some(local_file))
            }
            Err(ureq::Error::Status(404, _)) => {
                debug!(%url, "artifact not in remote cache");
                Ok(None)
            }
            Err(error) => Err(Error::BackendFailure(
                anyhow!(error).context(format!("fetching '{url}'")),
            )),
        }
    }

    fn put(&mut self, filename: &str, source: &Path) -> Result<()> {
        if self.readonly {
            debug!("skipping upload to remote cache (read only mode)");
            return Ok(());
        }
        let url = format!("{}/{}", self.bucket_url()?, self.object_key(filename));
        self.ensure_bucket()?;
        let reader = File::open(source)
            .with_context(|| format!("opening artifact '{}'", source.display()))
            .map_err(Error::BackendFailure)?;
        let agent = self.agent();
        info!(%url, "uploading artifact to remote cache");
        match agent.put(&url).send(reader) {
            Ok(_) => {
                debug!(%url, "finished uploading artifact");
                Ok(())
            }
            Err(error) => {
                // One failed upload, no more upload attempts; downloads
                // keep working.
                warn!(%url, %error, "upload failed, falling back to read only mode");
                self.readonly = true;
                Ok(())
            }
        }
    }
}
