//! Installation of transformed binary distribution archives.
//!
//! Takes a relocated archive (pathnames relative to an arbitrary prefix,
//! see the transform module) and extracts it into a concrete target prefix:
//! a virtual environment, `/usr/local`, or a Debian-style `/usr`. The
//! target may use a different directory layout than the build prefix did,
//! so layout substitutions are applied again here, relative to the target.
//!
//! Executable scripts get their interpreter hashbang rewritten to the
//! configured Python so that artifacts built in one environment run in
//! another.

use anyhow::{anyhow, Context, Result as AnyResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Where and how to install a binary distribution.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Target install prefix (virtual environment or system prefix).
    pub prefix: PathBuf,
    /// Interpreter substituted into rewritten hashbangs.
    pub python: PathBuf,
    /// Apply virtual environment workarounds (C headers install under
    /// `include/site/` because `include/` is a symlink in virtualenvs).
    pub virtualenv_compatible: bool,
    /// The target prefix uses the Debian `dist-packages` layout.
    pub dist_packages: bool,
    /// Record every installed file and write an `installed-files.txt`
    /// manifest so the package can be cleanly removed later.
    pub track_installed_files: bool,
}

impl InstallOptions {
    /// Options for installing into `prefix` with hashbangs pointing at
    /// `python`; workarounds off, no tracking.
    pub fn new(prefix: impl Into<PathBuf>, python: impl Into<PathBuf>) -> Self {
        InstallOptions {
            prefix: prefix.into(),
            python: python.into(),
            virtualenv_compatible: false,
            dist_packages: false,
            track_installed_files: false,
        }
    }
}

/// What an installation did.
#[derive(Debug)]
pub struct InstallReceipt {
    /// Number of files written below the prefix.
    pub files_written: usize,
    /// Pathname of the installed-files manifest, when tracking was on and
    /// the metadata directory could be identified.
    pub manifest: Option<PathBuf>,
}

/// Extract the transformed archive at `archive` into the target prefix.
///
/// Any write or permission failure aborts the installation and surfaces as
/// [`Error::Installation`].
pub fn install_archive(archive: &Path, options: &InstallOptions) -> Result<InstallReceipt> {
    install_inner(archive, options).map_err(Error::Installation)
}

fn install_inner(archive: &Path, options: &InstallOptions) -> AnyResult<InstallReceipt> {
    let file = File::open(archive)
        .with_context(|| format!("opening binary distribution '{}'", archive.display()))?;
    let mut reader = tar::Archive::new(GzDecoder::new(file));

    let mut installed = Vec::new();
    for entry in reader.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let member = entry.path().context("reading entry pathname")?.into_owned();
        let pathname = retarget(&member.to_string_lossy(), options);
        let target = options.prefix.join(&pathname);

        if let Some(directory) = target.parent() {
            fs::create_dir_all(directory)
                .with_context(|| format!("creating directory '{}'", directory.display()))?;
        }

        match entry.header().entry_type() {
            EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .context("reading link target")?
                    .ok_or_else(|| anyhow!("symlink entry without a target"))?
                    .into_owned();
                if target.exists() || target.is_symlink() {
                    fs::remove_file(&target)
                        .with_context(|| format!("replacing '{}'", target.display()))?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link_target, &target)
                    .with_context(|| format!("creating symlink '{}'", target.display()))?;
                debug!(pathname = %target.display(), "created symlink");
            }
            EntryType::Directory => continue,
            _ => {
                let mut contents = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut contents)
                    .with_context(|| format!("reading archive member '{}'", member.display()))?;
                if contents.starts_with(b"#!") {
                    if let Some(rewritten) = rewrite_hashbang(&contents, &options.python) {
                        debug!(pathname = %target.display(), "rewrote interpreter hashbang");
                        contents = rewritten;
                    }
                }
                fs::write(&target, &contents)
                    .with_context(|| format!("creating file '{}'", target.display()))?;

                let mode = entry.header().mode().unwrap_or(0o644);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                        .with_context(|| format!("setting mode of '{}'", target.display()))?;
                }
                #[cfg(not(unix))]
                let _ = mode;
                debug!(pathname = %target.display(), "created file");
            }
        }
        installed.push(target);
    }

    let manifest = if options.track_installed_files {
        write_installed_files_manifest(&installed)?
    } else {
        None
    };

    Ok(InstallReceipt {
        files_written: installed.len(),
        manifest,
    })
}

/// Apply the target-side layout substitutions to a relocated pathname.
fn retarget(pathname: &str, options: &InstallOptions) -> String {
    let mut pathname = pathname.to_string();
    if options.virtualenv_compatible {
        // In a virtual environment include/ is a symlink into the base
        // interpreter; write headers next to it instead of through it.
        if let Some(rest) = pathname.strip_prefix("include/") {
            pathname = format!("include/site/{rest}");
        }
    }
    if options.dist_packages {
        pathname = pathname.replace("/site-packages/", "/dist-packages/");
    }
    pathname
}

/// Rewrite an interpreter hashbang to point at `python`, when the hashbang
/// actually names a Python interpreter. Returns `None` when the content
/// should be left untouched.
fn rewrite_hashbang(contents: &[u8], python: &Path) -> Option<Vec<u8>> {
    let line_end = contents
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(contents.len());
    let first_line = std::str::from_utf8(&contents[..line_end]).ok()?;
    let interpreter = first_line.strip_prefix("#!")?.trim();

    // `#!/usr/bin/env python3.9` has the basename `env python3.9`.
    let basename = interpreter.rsplit('/').next().unwrap_or(interpreter);
    let executable = basename.strip_prefix("env ").unwrap_or(basename).trim();
    if !is_python_interpreter(executable) {
        return None;
    }

    let mut rewritten = Vec::with_capacity(contents.len());
    rewritten.extend_from_slice(b"#!");
    rewritten.extend_from_slice(python.to_string_lossy().as_bytes());
    rewritten.extend_from_slice(&contents[line_end..]);
    Some(rewritten)
}

/// `python`, `python3`, `python3.9`, ... and nothing else.
fn is_python_interpreter(executable: &str) -> bool {
    match executable.strip_prefix("python") {
        Some("") => true,
        Some(version) => version
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

/// Write `installed-files.txt` next to the package metadata so the package
/// manager can later remove the package.
///
/// The manifest lives in the `.egg-info` directory, identified by its
/// `PKG-INFO` file. When that directory cannot be determined reliably the
/// manifest is skipped with a warning; a wrong manifest is worse than
/// none.
fn write_installed_files_manifest(installed: &[PathBuf]) -> AnyResult<Option<PathBuf>> {
    let metadata_directories: Vec<&Path> = installed
        .iter()
        .filter(|pathname| {
            pathname.file_name().is_some_and(|name| name == "PKG-INFO")
                && pathname.parent().is_some_and(|parent| {
                    parent
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.ends_with(".egg-info"))
                })
        })
        .filter_map(|pathname| pathname.parent())
        .collect();

    let [metadata_directory] = metadata_directories.as_slice() else {
        warn!("not tracking installed files (could not reliably determine the .egg-info directory)");
        return Ok(None);
    };

    let manifest = metadata_directory.join("installed-files.txt");
    let mut lines = String::new();
    for pathname in installed {
        lines.push_str(&relative_to(pathname, metadata_directory).to_string_lossy());
        lines.push('\n');
    }
    fs::write(&manifest, lines)
        .with_context(|| format!("writing manifest '{}'", manifest.display()))?;
    debug!(manifest = %manifest.display(), "tracked installed files");
    Ok(Some(manifest))
}

/// Lexical relative path from `base` to `path` (both absolute), using `..`
/// segments where needed.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_components: Vec<Component> = path.components().collect();
    let base_components: Vec<Component> = base.components().collect();

    let common = path_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &path_components[common..] {
        relative.push(component.as_os_str());
    }
    relative
}
