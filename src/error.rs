//! Error types for pybuild-cache.
//!
//! The fallible surface of the crate uses [`Result`] with one crate-wide
//! error enum. The variants mirror the failure modes the rest of the crate
//! has to tell apart: a source tree that can never build, a build that may
//! succeed after installing system packages, a cache backend that is merely
//! unconfigured versus one that is actually broken, and an installation that
//! must abort. Ambient failures travel as [`anyhow::Error`] so call sites can
//! keep attaching context.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors reported by pybuild-cache.
#[derive(Debug, Error)]
pub enum Error {
    /// The source directory does not contain a recognized build descriptor.
    /// Fatal: retrying the build cannot help.
    #[error("{} does not contain a buildable source distribution (no setup.py)", .directory.display())]
    InvalidSourceDistribution {
        /// The offending source directory.
        directory: PathBuf,
    },

    /// The builder exited with a nonzero status.
    #[error("the build command reported an error\n\nbuild output:\n{build_log}")]
    BuildFailed {
        /// Combined stdout/stderr captured from the build subprocess.
        build_log: String,
    },

    /// The build succeeded but did not produce exactly one artifact.
    #[error("the build did not produce exactly one distribution archive\n\nbuild output:\n{build_log}")]
    NoBuildOutput {
        /// Combined stdout/stderr captured from the build subprocess.
        build_log: String,
    },

    /// A cache backend is missing required configuration. Expected and
    /// benign: the backend is skipped without noise.
    #[error("cache backend requires configuration: {reason}")]
    BackendDisabled {
        /// Human readable explanation of what is missing.
        reason: String,
    },

    /// A cache backend failed in an unexpected way. The backend is disabled
    /// for the remainder of the process.
    #[error("cache backend failed")]
    BackendFailure(#[source] anyhow::Error),

    /// Writing the binary distribution into the target prefix failed.
    /// Fatal: the installation is aborted.
    #[error("failed to install binary distribution")]
    Installation(#[source] anyhow::Error),

    /// Anything else: I/O, configuration parsing, subprocess plumbing.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error is a builder problem that warrants the fallback
    /// build strategy and, at the caller level, a single retry after
    /// installing missing system dependencies.
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Error::BuildFailed { .. } | Error::NoBuildOutput { .. })
    }

    /// The captured build log, when this error carries one.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Error::BuildFailed { build_log } | Error::NoBuildOutput { build_log } => {
                Some(build_log)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_failures_are_retryable() {
        let failed = Error::BuildFailed {
            build_log: "gcc: not found".into(),
        };
        let no_output = Error::NoBuildOutput {
            build_log: String::new(),
        };
        assert!(failed.is_build_failure());
        assert!(no_output.is_build_failure());
        assert!(!Error::BackendDisabled {
            reason: "no bucket".into()
        }
        .is_build_failure());
    }

    #[test]
    fn build_log_is_attached() {
        let err = Error::BuildFailed {
            build_log: "fatal error: Python.h: No such file".into(),
        };
        assert!(err.to_string().contains("Python.h"));
        assert_eq!(
            err.build_log(),
            Some("fatal error: Python.h: No such file")
        );
    }

    #[test]
    fn disabled_display_names_the_reason() {
        let err = Error::BackendDisabled {
            reason: "PYBUILD_REMOTE_BUCKET is not set".into(),
        };
        assert!(err.to_string().contains("PYBUILD_REMOTE_BUCKET"));
    }
}
