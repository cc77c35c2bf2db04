//! Building binary distributions from unpacked source trees.
//!
//! The [`Builder`] trait is the boundary to the external build tool: it
//! runs one build strategy against one source directory and reports the
//! artifacts it produced together with the captured build log. The
//! [`BuildOrchestrator`] owns the policy around it: descriptor validation,
//! the automatic fallback strategy, and the exactly-one-artifact
//! postcondition.
//!
//! Retrying a build after installing missing *system* packages is
//! deliberately not handled here; that is a caller-level decision (see the
//! distribution manager), attempted at most once.

use crate::error::{Error, Result};
use crate::requirement::Requirement;
use anyhow::Context;
use std::fmt;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// How the build tool is asked to produce a binary distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStrategy {
    /// Primary strategy: a "dumb" binary distribution, plain tar output.
    BdistDumb,
    /// Fallback for packages whose setup script does not properly support
    /// the primary strategy; emits a gzip tar.
    Bdist,
}

impl BuildStrategy {
    /// Arguments appended to the setup script invocation.
    pub fn args(self) -> &'static [&'static str] {
        match self {
            BuildStrategy::BdistDumb => &["bdist_dumb", "--format=tar"],
            BuildStrategy::Bdist => &["bdist", "--formats=gztar"],
        }
    }

    /// The strategy to fall back to after a failure, if any.
    pub fn fallback(self) -> Option<BuildStrategy> {
        match self {
            BuildStrategy::BdistDumb => Some(BuildStrategy::Bdist),
            BuildStrategy::Bdist => None,
        }
    }
}

impl fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStrategy::BdistDumb => write!(f, "bdist_dumb"),
            BuildStrategy::Bdist => write!(f, "bdist"),
        }
    }
}

/// What one build attempt produced.
#[derive(Debug)]
pub struct BuildOutput {
    /// Artifact files found in the build tool's output directory.
    pub artifacts: Vec<PathBuf>,
    /// Combined stdout/stderr of the build subprocess.
    pub log: String,
}

/// Boundary to the external build tool.
pub trait Builder {
    /// Run one build of `source_dir` with `strategy`.
    ///
    /// A nonzero exit must surface as [`Error::BuildFailed`] carrying the
    /// captured log; the artifact-count postcondition belongs to the
    /// orchestrator, not the builder.
    fn build(&self, source_dir: &Path, strategy: BuildStrategy) -> Result<BuildOutput>;
}

/// Default [`Builder`]: runs the configured Python interpreter against the
/// package's `setup.py`.
pub struct SetupPyBuilder {
    python: PathBuf,
}

impl SetupPyBuilder {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        SetupPyBuilder {
            python: python.into(),
        }
    }
}

impl Builder for SetupPyBuilder {
    fn build(&self, source_dir: &Path, strategy: BuildStrategy) -> Result<BuildOutput> {
        let setup_script = source_dir.join("setup.py");
        let dist_directory = source_dir.join("dist");

        // Leftovers from earlier builds would break artifact counting.
        if dist_directory.is_dir() {
            debug!(directory = %dist_directory.display(), "removing previously generated distributions");
            fs::remove_dir_all(&dist_directory).with_context(|| {
                format!("cleaning dist directory '{}'", dist_directory.display())
            })?;
        }

        // Force the setup script through setuptools (instead of distutils),
        // the same way pip does: setuptools writes the `.egg-info` metadata
        // directory that installed-file tracking depends on.
        let bootstrap = format!(
            "import setuptools; __file__={script:?}; \
             exec(compile(open(__file__).read().replace('\\r\\n', '\\n'), __file__, 'exec'))",
            script = setup_script.to_string_lossy()
        );

        let log_file = tempfile::tempfile().context("creating build log file")?;
        debug!(
            python = %self.python.display(),
            %strategy,
            "executing external build command"
        );
        let status = Command::new(&self.python)
            .arg("-c")
            .arg(&bootstrap)
            .args(strategy.args())
            .current_dir(source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log_file.try_clone().context("sharing build log file")?,
            ))
            .stderr(Stdio::from(
                log_file.try_clone().context("sharing build log file")?,
            ))
            .status()
            .with_context(|| format!("running '{}'", self.python.display()))?;

        let log = read_log(log_file)?;
        if !status.success() {
            return Err(Error::BuildFailed { build_log: log });
        }

        let mut artifacts = Vec::new();
        if dist_directory.is_dir() {
            for entry in fs::read_dir(&dist_directory).with_context(|| {
                format!("listing dist directory '{}'", dist_directory.display())
            })? {
                let entry = entry.context("listing dist directory")?;
                if entry
                    .file_type()
                    .context("listing dist directory")?
                    .is_file()
                {
                    artifacts.push(entry.path());
                }
            }
        }
        artifacts.sort();
        Ok(BuildOutput { artifacts, log })
    }
}

fn read_log(mut log_file: fs::File) -> Result<String> {
    let mut raw = Vec::new();
    log_file
        .seek(SeekFrom::Start(0))
        .and_then(|_| log_file.read_to_end(&mut raw))
        .context("reading build log file")?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Drives builds and enforces their postconditions.
pub struct BuildOrchestrator {
    builder: Box<dyn Builder>,
}

impl BuildOrchestrator {
    pub fn new(builder: Box<dyn Builder>) -> Self {
        BuildOrchestrator { builder }
    }

    /// Build a binary distribution archive for `requirement` and return its
    /// pathname.
    ///
    /// A source tree without a build descriptor fails immediately with
    /// [`Error::InvalidSourceDistribution`]; no strategy can save it. A
    /// builder failure (nonzero exit, wrong artifact count) is retried
    /// exactly once with the fallback strategy.
    pub fn build(&self, requirement: &Requirement) -> Result<PathBuf> {
        if !requirement.source_directory.join("setup.py").is_file() {
            return Err(Error::InvalidSourceDistribution {
                directory: requirement.source_directory.clone(),
            });
        }

        let mut strategy = BuildStrategy::BdistDumb;
        loop {
            info!(%requirement, %strategy, "building binary distribution");
            match self.attempt(requirement, strategy) {
                Err(error) if error.is_build_failure() => match strategy.fallback() {
                    Some(fallback) => {
                        warn!(%requirement, %strategy, "build failed, retrying with fallback strategy");
                        strategy = fallback;
                    }
                    None => return Err(error),
                },
                other => return other,
            }
        }
    }

    fn attempt(&self, requirement: &Requirement, strategy: BuildStrategy) -> Result<PathBuf> {
        let BuildOutput { mut artifacts, log } = self
            .builder
            .build(&requirement.source_directory, strategy)?;
        if artifacts.len() == 1 {
            let archive = artifacts.remove(0);
            info!(%requirement, archive = %archive.display(), "finished building binary distribution");
            Ok(archive)
        } else {
            // Zero or several archives: either way there is no single
            // authoritative artifact to cache.
            Err(Error::NoBuildOutput { build_log: log })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Builder that replays a script of canned results and records the
    /// strategies it was invoked with.
    struct ScriptedBuilder {
        results: RefCell<Vec<Result<BuildOutput>>>,
        invocations: Rc<RefCell<Vec<BuildStrategy>>>,
    }

    impl ScriptedBuilder {
        fn new(results: Vec<Result<BuildOutput>>) -> Self {
            ScriptedBuilder {
                results: RefCell::new(results),
                invocations: Rc::new(RefCell::new(Vec::new())),
            }
        }

        fn invocations(&self) -> Rc<RefCell<Vec<BuildStrategy>>> {
            Rc::clone(&self.invocations)
        }
    }

    impl Builder for ScriptedBuilder {
        fn build(&self, _source_dir: &Path, strategy: BuildStrategy) -> Result<BuildOutput> {
            self.invocations.borrow_mut().push(strategy);
            self.results.borrow_mut().remove(0)
        }
    }

    fn source_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("setup.py"), b"from setuptools import setup\nsetup()\n")
            .unwrap();
        tmp
    }

    fn one_artifact() -> Result<BuildOutput> {
        Ok(BuildOutput {
            artifacts: vec![PathBuf::from("/src/dist/pkg-1.0.linux-x86_64.tar")],
            log: String::new(),
        })
    }

    #[test]
    fn missing_setup_script_fails_without_invoking_the_builder() {
        let tmp = TempDir::new().unwrap();
        let requirement = Requirement::new("pkg", "1.0", tmp.path());
        let orchestrator = BuildOrchestrator::new(Box::new(ScriptedBuilder::new(vec![])));
        let err = orchestrator.build(&requirement).unwrap_err();
        assert!(matches!(err, Error::InvalidSourceDistribution { .. }));
    }

    #[test]
    fn successful_primary_build_is_not_retried() {
        let tree = source_tree();
        let requirement = Requirement::new("pkg", "1.0", tree.path());
        let builder = Box::new(ScriptedBuilder::new(vec![one_artifact()]));
        let orchestrator = BuildOrchestrator::new(builder);

        let archive = orchestrator.build(&requirement).unwrap();
        assert!(archive.to_string_lossy().ends_with(".tar"));
    }

    #[test]
    fn failed_primary_build_falls_back_once() {
        let tree = source_tree();
        let requirement = Requirement::new("pkg", "1.0", tree.path());
        let builder = ScriptedBuilder::new(vec![
            Err(Error::BuildFailed {
                build_log: "error: invalid command 'bdist_dumb'".into(),
            }),
            one_artifact(),
        ]);
        let invocations = builder.invocations();
        let orchestrator = BuildOrchestrator::new(Box::new(builder));

        orchestrator.build(&requirement).unwrap();
        assert_eq!(
            *invocations.borrow(),
            vec![BuildStrategy::BdistDumb, BuildStrategy::Bdist]
        );
    }

    #[test]
    fn wrong_artifact_count_triggers_the_fallback() {
        let tree = source_tree();
        let requirement = Requirement::new("pkg", "1.0", tree.path());
        let builder = ScriptedBuilder::new(vec![
            Ok(BuildOutput {
                artifacts: vec![
                    PathBuf::from("/src/dist/a.tar"),
                    PathBuf::from("/src/dist/b.tar"),
                ],
                log: "two archives".into(),
            }),
            one_artifact(),
        ]);
        let orchestrator = BuildOrchestrator::new(Box::new(builder));
        orchestrator.build(&requirement).unwrap();
    }

    #[test]
    fn both_strategies_failing_surfaces_the_fallback_error() {
        let tree = source_tree();
        let requirement = Requirement::new("pkg", "1.0", tree.path());
        let builder = ScriptedBuilder::new(vec![
            Err(Error::BuildFailed {
                build_log: "primary".into(),
            }),
            Ok(BuildOutput {
                artifacts: vec![],
                log: "nothing in dist/".into(),
            }),
        ]);
        let orchestrator = BuildOrchestrator::new(Box::new(builder));

        let err = orchestrator.build(&requirement).unwrap_err();
        assert!(matches!(err, Error::NoBuildOutput { .. }));
        assert_eq!(err.build_log(), Some("nothing in dist/"));
    }

    #[test]
    fn setup_py_builder_collects_the_single_artifact() {
        let tree = source_tree();
        // Stand-in interpreter: ignores its arguments, emits a log line and
        // one artifact under dist/.
        let fake_python = tree.path().join("fake-python");
        fs::write(
            &fake_python,
            b"#!/bin/sh\nmkdir -p dist\necho built ok\nprintf tar-bytes > dist/pkg-1.0.linux-x86_64.tar\n",
        )
        .unwrap();
        make_executable(&fake_python);

        let builder = SetupPyBuilder::new(&fake_python);
        let output = builder.build(tree.path(), BuildStrategy::BdistDumb).unwrap();
        assert_eq!(output.artifacts.len(), 1);
        assert!(output.log.contains("built ok"));
    }

    #[test]
    fn setup_py_builder_attaches_the_log_on_failure() {
        let tree = source_tree();
        let fake_python = tree.path().join("fake-python");
        fs::write(&fake_python, b"#!/bin/sh\necho missing header >&2\nexit 1\n").unwrap();
        make_executable(&fake_python);

        let builder = SetupPyBuilder::new(&fake_python);
        let err = builder
            .build(tree.path(), BuildStrategy::BdistDumb)
            .unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));
        assert!(err.build_log().unwrap().contains("missing header"));
    }

    #[test]
    fn setup_py_builder_cleans_stale_dist_directories() {
        let tree = source_tree();
        let dist = tree.path().join("dist");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("stale-0.9.tar"), b"stale").unwrap();

        let fake_python = tree.path().join("fake-python");
        fs::write(
            &fake_python,
            b"#!/bin/sh\nmkdir -p dist\nprintf fresh > dist/pkg-1.0.tar\n",
        )
        .unwrap();
        make_executable(&fake_python);

        let builder = SetupPyBuilder::new(&fake_python);
        let output = builder.build(tree.path(), BuildStrategy::BdistDumb).unwrap();
        assert_eq!(output.artifacts.len(), 1);
        assert!(output.artifacts[0].ends_with("dist/pkg-1.0.tar"));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
