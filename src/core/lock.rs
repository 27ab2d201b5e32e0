use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::error::{Error, Result};
use crate::paths::{self, StateLayout};

/// Exclusive per-environment deployment lock, released on drop.
///
/// Backed by an advisory lock on `stateDir/locks/<env>.lock`, so it also
/// excludes other stagehand processes sharing the state directory.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    environment: String,
}

impl DeployLock {
    /// Take the lock without waiting. Contention is `deploy.in_progress`.
    pub fn acquire(layout: &StateLayout, environment: &str) -> Result<Self> {
        paths::ensure_dir(&layout.locks())?;
        let path = layout.lock_file(environment);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("open {}", path.display())))
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(Error::deployment_in_progress(environment));
        }

        // Holder pid is informational only.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self {
            file,
            environment: environment.to_string(),
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::TempDir;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let state = TempDir::new().unwrap();
        let layout = StateLayout::new(state.path());

        let held = DeployLock::acquire(&layout, "staging").unwrap();
        let err = DeployLock::acquire(&layout, "staging").unwrap_err();
        assert_eq!(err.code, ErrorCode::DeployInProgress);
        assert_eq!(err.retryable, Some(true));

        drop(held);
        assert!(DeployLock::acquire(&layout, "staging").is_ok());
    }

    #[test]
    fn environments_lock_independently() {
        let state = TempDir::new().unwrap();
        let layout = StateLayout::new(state.path());

        let _staging = DeployLock::acquire(&layout, "staging").unwrap();
        let production = DeployLock::acquire(&layout, "production").unwrap();
        assert_eq!(production.environment(), "production");
    }
}
