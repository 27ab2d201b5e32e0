use crate::error::{Error, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "stagehand.json";
pub const CONFIG_ENV: &str = "STAGEHAND_CONFIG";

/// Locate stagehand.json: explicit flag, then `STAGEHAND_CONFIG`, then the
/// current directory.
pub fn config_file(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.trim().is_empty()) {
        return Ok(PathBuf::from(shellexpand::tilde(path).to_string()));
    }

    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
        }
    }

    let cwd = env::current_dir().map_err(|e| {
        Error::internal_io(e.to_string(), Some("read current directory".to_string()))
    })?;
    Ok(cwd.join(CONFIG_FILE))
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(path).to_string());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Layout of the state directory (backups, deployment history, locks).
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backups directory for one environment
    pub fn backups(&self, environment: &str) -> PathBuf {
        self.root.join("backups").join(environment)
    }

    pub fn backup_dir(&self, environment: &str, backup_id: &str) -> PathBuf {
        self.backups(environment).join(backup_id)
    }

    /// Deployment records directory for one environment
    pub fn deployments(&self, environment: &str) -> PathBuf {
        self.root.join("deployments").join(environment)
    }

    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_file(&self, environment: &str) -> PathBuf {
        self.locks().join(format!("{}.lock", environment))
    }

    /// Scratch space for archives staged by the local backend.
    pub fn incoming(&self, environment: &str) -> PathBuf {
        self.root.join("incoming").join(environment)
    }
}

/// Create a directory (and parents), mapping failures to IO errors.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("create {}", path.display())))
    })
}
