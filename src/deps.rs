//! System dependency resolution.
//!
//! Some packages only build once system libraries are present (`lxml` wants
//! libxml2 headers, `psycopg2` wants libpq). When a build fails, the
//! distribution manager gives a [`SystemDependencyResolver`] one chance to
//! install whatever is missing before retrying the build, exactly once.
//!
//! The resolver is a collaborator boundary: the cache core only cares about
//! the answer "did you install something worth a retry?".

use anyhow::{anyhow, Context, Result as AnyResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::requirement::{normalize_name, Requirement};

/// Installs missing system packages required by a build.
pub trait SystemDependencyResolver {
    /// Check for and install missing system dependencies of `requirement`.
    /// Returns `true` when packages were installed and a build retry is
    /// worthwhile.
    fn resolve(&self, requirement: &Requirement) -> Result<bool>;
}

/// Resolver that never installs anything. The default on hosts without a
/// supported package manager, and the right collaborator for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSystemPackages;

impl SystemDependencyResolver for NoSystemPackages {
    fn resolve(&self, requirement: &Requirement) -> Result<bool> {
        debug!(%requirement, "no system package resolver available");
        Ok(false)
    }
}

/// Debian/Ubuntu resolver: a known-dependencies table maps normalized
/// project names to the system packages their builds need.
#[derive(Debug, Clone, Default)]
pub struct AptSystemPackages {
    known_dependencies: BTreeMap<String, Vec<String>>,
    /// Install without prompting. When false the resolver only reports what
    /// is missing.
    auto_install: bool,
}

#[derive(Debug, Deserialize)]
struct DependencyTable {
    #[serde(default)]
    dependencies: BTreeMap<String, Vec<String>>,
}

impl AptSystemPackages {
    pub fn new(known_dependencies: BTreeMap<String, Vec<String>>, auto_install: bool) -> Self {
        let known_dependencies = known_dependencies
            .into_iter()
            .map(|(name, packages)| (normalize_name(&name), packages))
            .collect();
        AptSystemPackages {
            known_dependencies,
            auto_install,
        }
    }

    /// Load a dependency table from TOML:
    ///
    /// ```toml
    /// [dependencies]
    /// lxml = ["libxml2-dev", "libxslt1-dev"]
    /// ```
    pub fn from_toml_str(text: &str, auto_install: bool) -> AnyResult<Self> {
        let table: DependencyTable =
            toml::from_str(text).context("parsing system dependency table")?;
        Ok(Self::new(table.dependencies, auto_install))
    }

    /// The system packages known to be required by `name`, if any.
    fn known_for(&self, name: &str) -> Option<&[String]> {
        self.known_dependencies
            .get(&normalize_name(name))
            .map(Vec::as_slice)
    }

    fn is_installed(package: &str) -> bool {
        Command::new("dpkg-query")
            .args(["--show", package])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl SystemDependencyResolver for AptSystemPackages {
    fn resolve(&self, requirement: &Requirement) -> Result<bool> {
        info!(%requirement, "checking for missing system dependencies");
        let Some(known) = self.known_for(&requirement.name) else {
            info!(%requirement, "no known system dependencies");
            return Ok(false);
        };

        let missing: Vec<&str> = known
            .iter()
            .map(String::as_str)
            .filter(|package| !Self::is_installed(package))
            .collect();
        if missing.is_empty() {
            info!(%requirement, "all known system dependencies are installed");
            return Ok(false);
        }

        if !self.auto_install {
            warn!(
                %requirement,
                missing = %missing.join(" "),
                "missing system dependencies found but automatic installation is disabled"
            );
            return Ok(false);
        }

        info!(packages = %missing.join(" "), "installing missing system dependencies");
        let status = Command::new("apt-get")
            .args(["install", "--yes"])
            .args(&missing)
            .status()
            .context("running apt-get")?;
        if status.success() {
            info!("successfully installed missing system dependencies");
            Ok(true)
        } else {
            Err(crate::error::Error::Other(anyhow!(
                "failed to install missing system dependencies: {}",
                missing.join(" ")
            )))
        }
    }
}

/// Pick a resolver for the host: apt on Debian-style systems, otherwise
/// nothing.
pub fn default_resolver(
    on_debian: bool,
    auto_install: bool,
    known_dependencies: BTreeMap<String, Vec<String>>,
) -> Box<dyn SystemDependencyResolver> {
    if on_debian && Path::new("/usr/bin/apt-get").exists() {
        Box::new(AptSystemPackages::new(known_dependencies, auto_install))
    } else {
        Box::new(NoSystemPackages)
    }
}
