//! Package requirements and their source fingerprints.
//!
//! A [`Requirement`] is the unit of work handed to the cache: one package at
//! one version, with an unpacked source tree and the source archive(s) it
//! was unpacked from. The related archives are what cache invalidation
//! fingerprints: either their modification times or a SHA1 digest of their
//! contents.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Source archive extensions recognized when scanning the source index.
const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.bz2", ".tbz", ".tar.xz", ".txz", ".tar", ".zip",
];

/// A package to be built and cached.
///
/// Produced by an external resolution step; read-only to the cache layer.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Project name as published (may contain capitals, `-` or `_`).
    pub name: String,
    /// Version being installed.
    pub version: String,
    /// Directory containing the unpacked source distribution.
    pub source_directory: PathBuf,
    /// Source distribution archive(s) this requirement was unpacked from.
    pub related_archives: Vec<PathBuf>,
    /// Distinguishing URL for requirements that do not come from the
    /// default package index.
    pub url: Option<String>,
}

impl Requirement {
    /// Create a requirement with no related archives or URL.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        source_directory: impl Into<PathBuf>,
    ) -> Self {
        Requirement {
            name: name.into(),
            version: version.into(),
            source_directory: source_directory.into(),
            related_archives: Vec::new(),
            url: None,
        }
    }

    /// Locate the source archives for this requirement in `source_index`
    /// and record them as related archives.
    pub fn scan_related_archives(&mut self, source_index: &Path) -> Result<()> {
        self.related_archives = find_related_archives(source_index, &self.name, &self.version)?;
        Ok(())
    }

    /// The most recent modification time across the related archives.
    ///
    /// When no archives are known the current time is reported: in the
    /// balance between invalidating too rarely and too often, err towards
    /// too often.
    pub fn last_modified(&self) -> Result<SystemTime> {
        let mut newest = None;
        for archive in &self.related_archives {
            let mtime = archive
                .metadata()
                .and_then(|meta| meta.modified())
                .with_context(|| format!("reading mtime of '{}'", archive.display()))?;
            if newest.is_none_or(|seen| mtime > seen) {
                newest = Some(mtime);
            }
        }
        Ok(newest.unwrap_or_else(SystemTime::now))
    }

    /// Hex SHA1 digest over the concatenated contents of the related
    /// archives, sorted by pathname. The digest of the empty input is
    /// reported when no archives are known.
    pub fn checksum(&self) -> Result<String> {
        let mut sorted: Vec<&PathBuf> = self.related_archives.iter().collect();
        sorted.sort();

        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        for archive in sorted {
            let file = File::open(archive)
                .with_context(|| format!("opening source archive '{}'", archive.display()))?;
            let mut reader = BufReader::new(file);
            loop {
                let n = reader
                    .read(&mut buf)
                    .with_context(|| format!("reading source archive '{}'", archive.display()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.version)
    }
}

/// Normalize a project name for comparisons and cache keys: lowercase with
/// underscores folded to dashes.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

/// Find source distribution archives for `name`/`version` in the source
/// index directory.
///
/// Matching is case-insensitive and treats dashes and underscores as
/// equivalent, because project names appear in both spellings in the wild.
pub fn find_related_archives(
    source_index: &Path,
    name: &str,
    version: &str,
) -> Result<Vec<PathBuf>> {
    if !source_index.is_dir() {
        return Ok(Vec::new());
    }

    let wanted = normalize_name(&format!("{name}-{version}"));
    let mut matches = Vec::new();
    for entry in WalkDir::new(source_index)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(stem) = strip_archive_extension(file_name) {
            if normalize_name(stem) == wanted {
                matches.push(entry.path().to_path_buf());
            }
        }
    }
    matches.sort();
    Ok(matches)
}

fn strip_archive_extension(file_name: &str) -> Option<&str> {
    let lowered = file_name.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS
        .iter()
        .find(|ext| lowered.ends_with(*ext))
        .map(|ext| &file_name[..file_name.len() - ext.len()])
}
