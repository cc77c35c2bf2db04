//! Relocation transform for raw binary distribution archives.
//!
//! The build tool emits archives whose pathnames are relative to `/` in one
//! notation or another (`./opt/build/lib/...`, sometimes `opt/build/lib/...`)
//! and whose permission bits are occasionally broken by the upstream
//! packaging process. This module rewrites such an archive, in one streaming
//! pass, into the cacheable form: pathnames relative to the install prefix
//! the build ran against, canonicalized modes, gzip tar output.
//!
//! Entries that cannot be relocated are dropped, never installed somewhere
//! surprising: paths outside the build prefix and device files are skipped
//! with a warning, directory entries are skipped silently (the installer
//! recreates directories on demand).

use anyhow::{Context, Result as AnyResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::{debug, warn};

use crate::error::Result;

/// Target-platform dependent pathname rewrites applied after relocation.
#[derive(Debug, Clone)]
pub struct LayoutPolicy {
    /// Collapse a leading `local/` segment (`/usr/local` builds installed
    /// into `/usr` style prefixes).
    pub collapse_local: bool,
    /// Canonicalize the Debian `dist-packages` directory name to
    /// `site-packages` so cached artifacts are layout neutral.
    pub debian_site_packages: bool,
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        LayoutPolicy {
            collapse_local: true,
            debian_site_packages: false,
        }
    }
}

/// Rewrite the raw archive at `raw` into a relocatable gzip tar at `out`.
///
/// `build_prefix` is the install prefix the binary distribution was built
/// for; every surviving entry ends up relative to it. Returns the number of
/// entries written. Single pass: each entry's content is read exactly once.
pub fn transform_archive(
    raw: &Path,
    build_prefix: &Path,
    layout: &LayoutPolicy,
    out: &Path,
) -> Result<usize> {
    Ok(transform_inner(raw, build_prefix, layout, out)
        .with_context(|| format!("transforming binary distribution '{}'", raw.display()))?)
}

fn transform_inner(
    raw: &Path,
    build_prefix: &Path,
    layout: &LayoutPolicy,
    out: &Path,
) -> AnyResult<usize> {
    let reader = open_raw_archive(raw)?;
    let mut archive = tar::Archive::new(reader);

    let out_file =
        File::create(out).with_context(|| format!("creating '{}'", out.display()))?;
    let encoder = GzEncoder::new(out_file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut written = 0usize;
    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let original = entry.path().context("reading entry pathname")?.into_owned();
        let entry_type = entry.header().entry_type();

        let absolute = normalize_rooted(&original);
        if matches!(
            entry_type,
            EntryType::Char | EntryType::Block | EntryType::Fifo
        ) {
            warn!(pathname = %absolute.display(), "ignoring device file");
            continue;
        }
        if entry_type.is_dir() {
            continue;
        }

        let relative = match absolute.strip_prefix(build_prefix) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => {
                warn!(
                    original = %original.display(),
                    pathname = %absolute.display(),
                    prefix = %build_prefix.display(),
                    "failed to transform pathname in binary distribution to relative path"
                );
                continue;
            }
        };
        let rewritten = apply_layout(&relative.to_string_lossy(), layout);
        debug!(original = %original.display(), %rewritten, "transformed pathname");

        // Some upstream archives ship with the world readable bit missing;
        // canonicalize to exactly two modes.
        let mode = canonical_mode(entry.header().mode().unwrap_or(0o644));

        match entry_type {
            EntryType::Symlink | EntryType::Link => {
                let Some(target) = entry.link_name().context("reading link target")? else {
                    warn!(pathname = %absolute.display(), "ignoring link without a target");
                    continue;
                };
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(entry_type);
                header.set_size(0);
                header.set_mode(mode);
                header.set_mtime(entry.header().mtime().unwrap_or(0));
                builder
                    .append_link(&mut header, &rewritten, &target)
                    .with_context(|| format!("appending link '{rewritten}'"))?;
            }
            _ => {
                let mut header = entry.header().clone();
                header.set_mode(mode);
                builder
                    .append_data(&mut header, &rewritten, &mut entry)
                    .with_context(|| format!("appending '{rewritten}'"))?;
            }
        }
        written += 1;
    }

    let encoder = builder
        .into_inner()
        .context("finalizing transformed archive")?;
    encoder
        .finish()
        .context("finalizing gzip stream")?
        .sync_all()
        .context("flushing transformed archive")?;
    Ok(written)
}

/// Open a raw build archive, transparently handling gzip compression: the
/// primary build strategy emits plain tar, the fallback emits gzip tar.
fn open_raw_archive(path: &Path) -> AnyResult<Box<dyn Read>> {
    let mut file =
        File::open(path).with_context(|| format!("opening archive '{}'", path.display()))?;
    let mut magic = [0u8; 2];
    let n = file
        .read(&mut magic)
        .with_context(|| format!("reading archive '{}'", path.display()))?;
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("rewinding archive '{}'", path.display()))?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Interpret an archive pathname as rooted at `/`, resolving `.` and `..`
/// lexically. Handles both notations seen in raw archives:
/// `./opt/build/...` and `opt/build/...`.
fn normalize_rooted(name: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in name.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Owner-executable entries become 0755, everything else 0644.
fn canonical_mode(mode: u32) -> u32 {
    if mode & 0o100 != 0 {
        0o755
    } else {
        0o644
    }
}

fn apply_layout(relative: &str, layout: &LayoutPolicy) -> String {
    let mut pathname = relative.to_string();
    if layout.collapse_local {
        if let Some(stripped) = pathname.strip_prefix("local/") {
            pathname = stripped.to_string();
        }
    }
    if layout.debian_site_packages {
        pathname = pathname.replace("/dist-packages/", "/site-packages/");
    }
    pathname
}
