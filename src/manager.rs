//! The get-or-build-and-cache flow.
//!
//! [`DistributionManager`] ties the pieces together: look the requirement
//! up in the artifact cache, invalidate stale hits, otherwise build a raw
//! binary distribution, relocate it, push it through every cache backend
//! and hand back the local pathname. Installation is a thin layer on top.
//!
//! Failure policy at this level: backend trouble is invisible (the cache
//! degrades to a miss), build trouble gets one shot at resolving missing
//! system dependencies before giving up, and only "no backend accepted the
//! artifact at all" surfaces as a cache-related error.

use anyhow::{anyhow, Context};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::build::{BuildOrchestrator, Builder, SetupPyBuilder};
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::deps::{default_resolver, SystemDependencyResolver};
use crate::error::Result;
use crate::install::{install_archive, InstallOptions, InstallReceipt};
use crate::invalidate::InvalidationPolicy;
use crate::requirement::Requirement;
use crate::transform::{transform_archive, LayoutPolicy};

/// Generates, caches and installs binary distributions.
pub struct DistributionManager {
    config: Config,
    cache: ArtifactCache,
    policy: InvalidationPolicy,
    orchestrator: BuildOrchestrator,
    system_packages: Box<dyn SystemDependencyResolver>,
}

impl DistributionManager {
    /// Manager with the default collaborators for `config`: the setup.py
    /// builder and the host's system package resolver.
    pub fn new(config: Config) -> Self {
        let builder = Box::new(SetupPyBuilder::new(&config.python_executable));
        let resolver = default_resolver(
            config.on_debian,
            config.auto_install_deps,
            BTreeMap::new(),
        );
        Self::with_collaborators(config, builder, resolver)
    }

    /// Manager with explicit collaborators.
    pub fn with_collaborators(
        config: Config,
        builder: Box<dyn Builder>,
        system_packages: Box<dyn SystemDependencyResolver>,
    ) -> Self {
        DistributionManager {
            cache: ArtifactCache::new(&config),
            policy: InvalidationPolicy::for_trust_mod_times(config.trust_mod_times),
            orchestrator: BuildOrchestrator::new(builder),
            system_packages,
            config,
        }
    }

    /// Layout rewrites for artifacts built on this host.
    fn layout_policy(&self) -> LayoutPolicy {
        LayoutPolicy {
            collapse_local: true,
            debian_site_packages: self.config.on_debian,
        }
    }

    /// Install options matching the configuration.
    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            prefix: self.config.install_prefix.clone(),
            python: self.config.python_executable.clone(),
            virtualenv_compatible: self.config.virtualenv_compatible,
            dist_packages: self.config.on_debian,
            track_installed_files: false,
        }
    }

    /// Get the cached binary distribution for `requirement`, building and
    /// caching it first when it is missing or stale. Returns the pathname
    /// of the artifact in the local cache.
    pub fn get_binary_dist(&mut self, requirement: &Requirement) -> Result<PathBuf> {
        let mut cached = self.cache.get(requirement);
        if let Some(pathname) = &cached {
            if self.policy.is_stale(requirement, pathname)? {
                info!(%requirement, "invalidating cached binary distribution (source has changed)");
                cached = None;
            }
        }
        if let Some(pathname) = cached {
            return Ok(pathname);
        }
        debug!(%requirement, "binary distribution not cached yet, building now");

        let raw_archive = self.build_with_dependency_retry(requirement)?;

        // Relocate into a staging file; nothing reaches a backend unless
        // build and transform both succeeded.
        let staging = tempfile::Builder::new()
            .prefix("pybuild-")
            .suffix(".tar.gz")
            .tempfile()
            .context("creating staging file for transformed archive")?;
        transform_archive(
            &raw_archive,
            &self.config.install_prefix,
            &self.layout_policy(),
            staging.path(),
        )?;

        self.cache.put(requirement, staging.path());
        let pathname = self.cache.get(requirement).ok_or_else(|| {
            anyhow!("none of the configured cache backends accepted the binary distribution of {requirement}")
        })?;
        self.policy.record(requirement, &pathname)?;
        Ok(pathname)
    }

    /// Build the raw binary distribution, retrying at most once after the
    /// system dependency resolver installed missing packages.
    fn build_with_dependency_retry(&mut self, requirement: &Requirement) -> Result<PathBuf> {
        match self.orchestrator.build(requirement) {
            Err(error) if error.is_build_failure() => {
                warn!(%requirement, "build failed, checking for missing system dependencies");
                if self.system_packages.resolve(requirement)? {
                    self.orchestrator.build(requirement)
                } else {
                    Err(error)
                }
            }
            other => other,
        }
    }

    /// Get (or build) the binary distribution and install it.
    pub fn install(
        &mut self,
        requirement: &Requirement,
        options: &InstallOptions,
    ) -> Result<InstallReceipt> {
        let archive = self.get_binary_dist(requirement)?;
        install_archive(&archive, options)
    }
}
