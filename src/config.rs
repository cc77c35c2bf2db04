//! Runtime configuration.
//!
//! Configuration is resolved from three layers, weakest first: built-in
//! defaults, an optional TOML file, and `PYBUILD_*` environment variables.
//! The library never requires a configuration file; every field has a
//! usable default so `Config::from_environment()` works on a bare machine.
//!
//! Resolution order per field:
//! 1. `PYBUILD_*` environment variable
//! 2. Configuration file (`$PYBUILD_CONFIG` or `<config dir>/pybuild-cache.toml`)
//! 3. Built-in default

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all cache state.
    pub data_directory: PathBuf,
    /// Directory holding downloaded source distribution archives.
    pub source_index: PathBuf,
    /// Local binary artifact cache root.
    pub binary_cache: PathBuf,
    /// Install prefix the binary distributions are built for.
    pub install_prefix: PathBuf,
    /// Python interpreter used to build and referenced by rewritten hashbangs.
    pub python_executable: PathBuf,
    /// Platform tag embedded in cache keys (e.g. `py3.11`).
    pub platform_tag: String,
    /// Trust modification times for cache invalidation; when false, SHA1
    /// checksums of the source archives are used instead.
    pub trust_mod_times: bool,
    /// Whether the host uses the Debian Python directory layout
    /// (`dist-packages` instead of `site-packages`).
    pub on_debian: bool,
    /// Apply virtual environment filename workarounds during installation.
    pub virtualenv_compatible: bool,
    /// Allow the system dependency resolver to install missing packages
    /// without prompting.
    pub auto_install_deps: bool,
    /// Remote object store settings.
    pub remote: RemoteCacheConfig,
}

/// Settings for the remote object-store cache backend.
///
/// The backend stays disabled until both `endpoint` and `bucket` are set.
#[derive(Debug, Clone, Default)]
pub struct RemoteCacheConfig {
    /// Base URL of an S3-compatible object store (e.g. `http://localhost:4567`).
    pub endpoint: Option<String>,
    /// Bucket holding the cached artifacts.
    pub bucket: Option<String>,
    /// Optional key prefix inside the bucket.
    pub prefix: Option<String>,
    /// Never upload; serve downloads only.
    pub readonly: bool,
    /// Create the bucket on first use when it does not exist.
    pub create_bucket: bool,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

/// On-disk configuration file shape. All fields optional; anything left out
/// falls back to the environment or the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    data_directory: Option<PathBuf>,
    source_index: Option<PathBuf>,
    binary_cache: Option<PathBuf>,
    install_prefix: Option<PathBuf>,
    python_executable: Option<PathBuf>,
    platform_tag: Option<String>,
    trust_mod_times: Option<bool>,
    on_debian: Option<bool>,
    virtualenv_compatible: Option<bool>,
    auto_install_deps: Option<bool>,
    remote: RemoteFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RemoteFile {
    endpoint: Option<String>,
    bucket: Option<String>,
    prefix: Option<String>,
    readonly: Option<bool>,
    create_bucket: Option<bool>,
    timeout_secs: Option<u64>,
}

impl Config {
    /// Resolve configuration from defaults and `PYBUILD_*` environment
    /// variables, loading the configuration file when one exists.
    pub fn from_environment() -> Result<Self> {
        let file = match config_file_path() {
            Some(path) if path.is_file() => parse_config_file(&path)?,
            _ => ConfigFile::default(),
        };
        Ok(Self::resolve(file))
    }

    /// Resolve configuration from an explicit TOML file plus the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = parse_config_file(path)?;
        Ok(Self::resolve(file))
    }

    fn resolve(file: ConfigFile) -> Self {
        let data_directory = env_path("PYBUILD_DATA_DIR")
            .or(file.data_directory)
            .unwrap_or_else(default_data_directory);
        let source_index = env_path("PYBUILD_SOURCE_INDEX")
            .or(file.source_index)
            .unwrap_or_else(|| data_directory.join("sources"));
        let binary_cache = env_path("PYBUILD_BINARY_CACHE")
            .or(file.binary_cache)
            .unwrap_or_else(|| data_directory.join("binaries"));
        let install_prefix = env_path("PYBUILD_INSTALL_PREFIX")
            .or(file.install_prefix)
            .unwrap_or_else(default_install_prefix);
        let python_executable = env_path("PYBUILD_PYTHON")
            .or(file.python_executable)
            .unwrap_or_else(default_python_executable);
        let platform_tag = env::var("PYBUILD_PLATFORM_TAG")
            .ok()
            .or(file.platform_tag)
            .unwrap_or_else(|| platform_tag_for(&python_executable));
        let on_debian = env_flag("PYBUILD_ON_DEBIAN")
            .or(file.on_debian)
            .unwrap_or_else(|| Path::new("/etc/debian_version").exists());

        Config {
            trust_mod_times: env_flag("PYBUILD_TRUST_MOD_TIMES")
                .or(file.trust_mod_times)
                .unwrap_or(true),
            virtualenv_compatible: env_flag("PYBUILD_VIRTUALENV_COMPATIBLE")
                .or(file.virtualenv_compatible)
                .unwrap_or(true),
            auto_install_deps: env_flag("PYBUILD_AUTO_INSTALL")
                .or(file.auto_install_deps)
                .unwrap_or(false),
            remote: RemoteCacheConfig {
                endpoint: env::var("PYBUILD_REMOTE_ENDPOINT").ok().or(file.remote.endpoint),
                bucket: env::var("PYBUILD_REMOTE_BUCKET").ok().or(file.remote.bucket),
                prefix: env::var("PYBUILD_REMOTE_PREFIX").ok().or(file.remote.prefix),
                readonly: env_flag("PYBUILD_REMOTE_READONLY")
                    .or(file.remote.readonly)
                    .unwrap_or(false),
                create_bucket: env_flag("PYBUILD_REMOTE_CREATE_BUCKET")
                    .or(file.remote.create_bucket)
                    .unwrap_or(false),
                timeout_secs: env::var("PYBUILD_REMOTE_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .or(file.remote.timeout_secs)
                    .unwrap_or(60),
            },
            data_directory,
            source_index,
            binary_cache,
            install_prefix,
            python_executable,
            platform_tag,
            on_debian,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(ConfigFile::default())
    }
}

fn parse_config_file(path: &Path) -> Result<ConfigFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading configuration file '{}'", path.display()))?;
    toml::from_str(&text)
        .with_context(|| format!("parsing configuration file '{}'", path.display()))
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var("PYBUILD_CONFIG") {
        return Some(PathBuf::from(explicit));
    }
    dirs::config_dir().map(|dir| dir.join("pybuild-cache.toml"))
}

fn default_data_directory() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("pybuild-cache"))
        .unwrap_or_else(|| PathBuf::from(".pybuild-cache"))
}

fn default_install_prefix() -> PathBuf {
    match env::var("VIRTUAL_ENV") {
        Ok(venv) if !venv.is_empty() => PathBuf::from(venv),
        _ => PathBuf::from("/usr/local"),
    }
}

fn default_python_executable() -> PathBuf {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .unwrap_or_else(|_| PathBuf::from("/usr/bin/python3"))
}

/// Derive a cache platform tag from the interpreter's file name:
/// `python3.11` becomes `py3.11`. Interpreters without a version suffix
/// fall back to `py3`.
fn platform_tag_for(python: &Path) -> String {
    let name = python
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.strip_prefix("python") {
        Some(version)
            if !version.is_empty()
                && version
                    .split('.')
                    .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())) =>
        {
            format!("py{version}")
        }
        _ => "py3".to_string(),
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tag_from_versioned_interpreter() {
        assert_eq!(platform_tag_for(Path::new("/usr/bin/python3.11")), "py3.11");
        assert_eq!(platform_tag_for(Path::new("/opt/py/bin/python3")), "py3");
        assert_eq!(platform_tag_for(Path::new("/usr/bin/python")), "py3");
        // Not an interpreter version suffix.
        assert_eq!(platform_tag_for(Path::new("/usr/bin/python-config")), "py3");
    }

    #[test]
    fn derived_directories_follow_data_directory() {
        let file: ConfigFile = toml::from_str("data_directory = '/var/cache/pb'").unwrap();
        let config = Config::resolve(file);
        assert_eq!(config.source_index, Path::new("/var/cache/pb/sources"));
        assert_eq!(config.binary_cache, Path::new("/var/cache/pb/binaries"));
    }

    #[test]
    fn file_settings_are_parsed() {
        let file: ConfigFile = toml::from_str(
            r#"
            install_prefix = "/usr"
            trust_mod_times = false

            [remote]
            endpoint = "http://localhost:4567"
            bucket = "pybuild"
            readonly = true
            "#,
        )
        .unwrap();
        let config = Config::resolve(file);
        assert_eq!(config.install_prefix, Path::new("/usr"));
        assert!(!config.trust_mod_times);
        assert_eq!(config.remote.bucket.as_deref(), Some("pybuild"));
        assert!(config.remote.readonly);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<ConfigFile>("binary_cach = '/tmp'").is_err());
    }
}
