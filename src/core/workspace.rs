use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::build::{BuildOptions, BuildStep};
use crate::defaults::{self, StagehandConfig};
use crate::environment::EnvironmentRegistry;
use crate::error::{Error, Result};
use crate::health::HealthVerifier;
use crate::paths::{self, StateLayout};
use crate::pipeline::{CancelFlag, PipelineController};
use crate::transport::TransportFactory;
use crate::utils::archive::ExcludeSet;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Loaded configuration plus the directories it is relative to.
///
/// Relative paths in stagehand.json resolve against the directory that
/// holds the file, not the process working directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub config_path: PathBuf,
    pub base_dir: PathBuf,
    pub config: StagehandConfig,
    pub layout: StateLayout,
}

impl Workspace {
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        let config_path = absolute(&paths::config_file(explicit)?)?;
        let config = defaults::load_config(&config_path)?;
        Ok(Self::from_config(config_path, config))
    }

    pub fn from_config(config_path: PathBuf, config: StagehandConfig) -> Self {
        let base_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let layout = StateLayout::new(paths::resolve_against(&base_dir, &config.state_dir));
        Self {
            config_path,
            base_dir,
            config,
            layout,
        }
    }

    pub fn registry(&self) -> Result<EnvironmentRegistry> {
        EnvironmentRegistry::from_process(&self.config, &self.base_dir)
    }

    pub fn source_dir(&self) -> PathBuf {
        paths::resolve_against(&self.base_dir, &self.config.build.source_dir)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        paths::resolve_against(&self.base_dir, &self.config.build.artifact_dir)
    }

    pub fn build_options(&self, overwrite: bool) -> BuildOptions {
        let mut excludes = ExcludeSet::new(self.config.build.excludes.iter().cloned());
        // The state directory never ships, wherever it is configured.
        if let Ok(relative) = self.layout.root().strip_prefix(self.source_dir()) {
            let relative = relative.to_string_lossy().replace('\\', "/");
            if !relative.is_empty() {
                excludes.push(format!("/{}", relative));
            }
        }

        BuildOptions {
            source_dir: self.source_dir(),
            artifact_dir: self.artifact_dir(),
            prefix: self.config.project.name.clone(),
            excludes,
            toolchain: self.config.build.toolchain.clone(),
            probe_timeout: PROBE_TIMEOUT,
            overwrite,
        }
    }

    pub fn build_steps(&self) -> Vec<BuildStep> {
        self.config
            .build
            .steps
            .iter()
            .map(|step| BuildStep::from_config(step, self.config.build.step_timeout_secs))
            .collect()
    }

    pub fn controller(&self, cancel: CancelFlag) -> Result<PipelineController> {
        let factory = TransportFactory::new(
            self.layout.clone(),
            Duration::from_secs(self.config.deploy.command_timeout_secs),
        );
        Ok(PipelineController::new(
            self.registry()?,
            self.layout.clone(),
            Box::new(factory),
            HealthVerifier::standard(&self.config.health),
            &self.config.deploy,
        )
        .with_cancel(cancel))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| {
        Error::internal_io(e.to_string(), Some("read current directory".to_string()))
    })?;
    Ok(cwd.join(path))
}
