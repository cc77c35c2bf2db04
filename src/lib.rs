//! Build-artifact cache that accelerates repeated Python package builds.
//!
//! Building a package from source is expensive; installing an already-built
//! binary distribution is cheap. This crate caches the expensive step,
//! keyed by package identity and a fingerprint of its source archives:
//!
//! ```text
//! DistributionManager::get_binary_dist(requirement)
//!     │
//!     ├── ArtifactCache::get ── LocalBackend ── RemoteBackend
//!     │       (miss or stale?)
//!     ├── BuildOrchestrator ── Builder (setup.py, fallback strategy)
//!     ├── transform_archive   (relocate paths, canonicalize modes)
//!     ├── ArtifactCache::put  (atomic write-through, failure isolation)
//!     └── InvalidationPolicy::record (checksum sidecar)
//!
//! install_archive(artifact, options)   (extract, rewrite hashbangs)
//! ```
//!
//! Everything is synchronous and blocking. The concurrency story is
//! multiple independent processes sharing one cache directory: local writes
//! go through an atomic tmp+rename protocol, so readers observe either
//! nothing or a complete artifact, and concurrent builders of the same
//! requirement race harmlessly (duplicate work, last rename wins).
//!
//! The crate emits diagnostics through [`tracing`] and installs no
//! subscriber; embedding applications own logging setup.

pub mod build;
pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod install;
pub mod invalidate;
pub mod manager;
pub mod requirement;
pub mod transform;

pub use build::{BuildOrchestrator, BuildOutput, BuildStrategy, Builder, SetupPyBuilder};
pub use cache::{ArtifactCache, Backend, LocalBackend, RemoteBackend};
pub use config::{Config, RemoteCacheConfig};
pub use deps::{AptSystemPackages, NoSystemPackages, SystemDependencyResolver};
pub use error::{Error, Result};
pub use install::{install_archive, InstallOptions, InstallReceipt};
pub use invalidate::InvalidationPolicy;
pub use manager::DistributionManager;
pub use requirement::Requirement;
pub use transform::{transform_archive, LayoutPolicy};
