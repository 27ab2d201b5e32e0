#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stagehand::build::{ArtifactBuilder, BuildArtifact, BuildOptions, ShellStepRunner};
use stagehand::defaults::{self, EnvironmentEntry, StagehandConfig};
use stagehand::environment::{EnvironmentConfig, EnvironmentRegistry};
use stagehand::git::SourceInfo;
use stagehand::health::HealthVerifier;
use stagehand::paths::StateLayout;
use stagehand::pipeline::{CancelFlag, PipelineController, RunOptions};
use stagehand::transport::{BackendFactory, DeployBackend, TransportFactory};
use stagehand::utils::archive::ExcludeSet;
use stagehand::utils::command::CommandOutput;
use stagehand::{Error, Result};
use tempfile::TempDir;

/// A source tree, two local environments and a state directory.
pub struct Site {
    pub source: TempDir,
    pub targets: TempDir,
    pub state: TempDir,
    pub config: StagehandConfig,
}

impl Site {
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        let targets = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();

        write(source.path(), "index.php", "<?php echo 'v2';");
        write(source.path(), "skins/main.css", "body{}");

        let mut config = defaults::builtin_defaults();
        for name in ["staging", "production"] {
            let root = targets.path().join(name);
            fs::create_dir_all(&root).unwrap();
            write(&root, "index.php", "<?php echo 'v1';");
            write(&root, "images/logo.png", "png-bytes");
            config.environments.insert(
                name.to_string(),
                EnvironmentEntry {
                    host: Some("localhost".to_string()),
                    path: Some(root.to_string_lossy().to_string()),
                    ..Default::default()
                },
            );
        }

        Self {
            source,
            targets,
            state,
            config,
        }
    }

    pub fn root(&self, env: &str) -> PathBuf {
        self.targets.path().join(env)
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.state.path())
    }

    pub fn registry(&self) -> EnvironmentRegistry {
        EnvironmentRegistry::from_sources(&self.config, &BTreeMap::new(), self.targets.path())
            .unwrap()
    }

    pub fn env(&self, name: &str) -> EnvironmentConfig {
        self.registry().resolve(name).unwrap()
    }

    pub fn factory(&self) -> TransportFactory {
        TransportFactory::new(self.layout(), Duration::from_secs(10))
    }

    pub fn controller_with(
        &self,
        factory: Box<dyn BackendFactory>,
        verifier: HealthVerifier,
    ) -> PipelineController {
        PipelineController::new(
            self.registry(),
            self.layout(),
            factory,
            verifier,
            &self.config.deploy,
        )
    }

    pub fn controller(&self) -> PipelineController {
        self.controller_with(
            Box::new(self.factory()),
            HealthVerifier::new(Duration::from_secs(2)),
        )
    }

    pub fn artifact(&self) -> BuildArtifact {
        let options = BuildOptions {
            source_dir: self.source.path().to_path_buf(),
            artifact_dir: self.state.path().join("dist"),
            prefix: "site".to_string(),
            excludes: ExcludeSet::default(),
            toolchain: BTreeMap::new(),
            probe_timeout: Duration::from_secs(5),
            overwrite: true,
        };
        ArtifactBuilder::new(options, ShellStepRunner)
            .with_source(SourceInfo {
                revision: "a1b2c3d4e5f6a7b8".to_string(),
                branch: "main".to_string(),
            })
            .build(&[])
            .unwrap()
            .artifact
    }

    /// Options with verification off; tests that verify turn it back on.
    pub fn options(&self) -> RunOptions {
        let mut options = RunOptions::from_config(&self.config);
        options.verify = false;
        options
    }
}

pub fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Every file under `root` with its bytes, keyed by relative path.
pub fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                out.insert(relative, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

/// Backend whose next `apply` half-applies the archive and then fails.
pub struct FlakyApply {
    inner: Arc<dyn DeployBackend>,
    armed: Arc<AtomicBool>,
}

impl DeployBackend for FlakyApply {
    fn describe(&self) -> String {
        format!("flaky({})", self.inner.describe())
    }

    fn existing_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        self.inner.existing_paths(paths)
    }

    fn capture(&self, paths: &[String], dest: &Path) -> Result<()> {
        self.inner.capture(paths, dest)
    }

    fn remove_paths(&self, paths: &[String]) -> Result<()> {
        self.inner.remove_paths(paths)
    }

    fn transfer(&self, archive: &Path) -> Result<String> {
        self.inner.transfer(archive)
    }

    fn apply(&self, staged: &str) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.inner.apply(staged)?;
            return Err(Error::internal_io("disk quota exceeded", None));
        }
        self.inner.apply(staged)
    }

    fn run(&self, command: &str, timeout: Duration) -> CommandOutput {
        self.inner.run(command, timeout)
    }
}

pub struct FlakyFactory {
    pub inner: TransportFactory,
    pub armed: Arc<AtomicBool>,
}

impl BackendFactory for FlakyFactory {
    fn backend_for(&self, env: &EnvironmentConfig) -> Result<Arc<dyn DeployBackend>> {
        Ok(Arc::new(FlakyApply {
            inner: self.inner.backend_for(env)?,
            armed: Arc::clone(&self.armed),
        }))
    }
}

/// Stage at which [`Tripwire`] requests cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    Capture,
    Transfer,
}

/// Backend that raises the cancel flag once, right after the chosen
/// operation succeeds, as a Ctrl-C arriving mid-stage would.
pub struct Tripwire {
    inner: Arc<dyn DeployBackend>,
    at: Trip,
    cancel: CancelFlag,
    armed: Arc<AtomicBool>,
}

impl Tripwire {
    fn trip(&self, stage: Trip) {
        if stage == self.at && self.armed.swap(false, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

impl DeployBackend for Tripwire {
    fn describe(&self) -> String {
        format!("tripwire({})", self.inner.describe())
    }

    fn existing_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        self.inner.existing_paths(paths)
    }

    fn capture(&self, paths: &[String], dest: &Path) -> Result<()> {
        self.inner.capture(paths, dest)?;
        self.trip(Trip::Capture);
        Ok(())
    }

    fn remove_paths(&self, paths: &[String]) -> Result<()> {
        self.inner.remove_paths(paths)
    }

    fn transfer(&self, archive: &Path) -> Result<String> {
        let staged = self.inner.transfer(archive)?;
        self.trip(Trip::Transfer);
        Ok(staged)
    }

    fn apply(&self, staged: &str) -> Result<()> {
        self.inner.apply(staged)
    }

    fn run(&self, command: &str, timeout: Duration) -> CommandOutput {
        self.inner.run(command, timeout)
    }
}

pub struct TripwireFactory {
    pub inner: TransportFactory,
    pub at: Trip,
    pub cancel: CancelFlag,
    pub armed: Arc<AtomicBool>,
}

impl TripwireFactory {
    pub fn new(inner: TransportFactory, at: Trip, cancel: CancelFlag) -> Self {
        Self {
            inner,
            at,
            cancel,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl BackendFactory for TripwireFactory {
    fn backend_for(&self, env: &EnvironmentConfig) -> Result<Arc<dyn DeployBackend>> {
        Ok(Arc::new(Tripwire {
            inner: self.inner.backend_for(env)?,
            at: self.at,
            cancel: self.cancel.clone(),
            armed: Arc::clone(&self.armed),
        }))
    }
}

impl Site {
    /// Controller whose runs are cancelled once `at` completes.
    pub fn tripwire_controller(&self, at: Trip) -> PipelineController {
        let cancel = CancelFlag::new();
        let factory = TripwireFactory::new(self.factory(), at, cancel.clone());
        self.controller_with(
            Box::new(factory),
            HealthVerifier::new(Duration::from_secs(2)),
        )
        .with_cancel(cancel)
    }
}
