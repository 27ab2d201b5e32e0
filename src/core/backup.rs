use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::environment::EnvironmentConfig;
use crate::error::{Error, Result};
use crate::paths::{self, StateLayout};
use crate::transport::DeployBackend;
use crate::utils::archive;
use crate::utils::timestamp;

const ARCHIVE_FILE: &str = "backup.zip";
const RECORD_FILE: &str = "record.json";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Snapshot of a target taken before it was changed. Never rewritten once
/// `record.json` exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub backup_timestamp: DateTime<Utc>,
    pub environment_name: String,
    /// Paths requested, in order. Restore replaces exactly these.
    pub source_paths: Vec<String>,
    /// Paths that existed and were archived.
    pub captured_paths: Vec<String>,
    pub archive_location: PathBuf,
    #[serde(default)]
    pub no_prior_state: bool,
}

pub struct BackupManager {
    layout: StateLayout,
}

impl BackupManager {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    /// Capture `paths` from the target into a new, uniquely named backup.
    pub fn snapshot(
        &self,
        env: &EnvironmentConfig,
        backend: &dyn DeployBackend,
        source_paths: &[String],
    ) -> Result<BackupRecord> {
        let root = self.layout.backups(&env.name);
        paths::ensure_dir(&root).map_err(|e| Error::snapshot_failed(&env.name, e.message))?;

        let (id, backup_timestamp, dir) = claim_directory(&root)
            .map_err(|e| Error::snapshot_failed(&env.name, e.message))?;

        log_status!(
            "backup",
            "Capturing {} from {} as {}",
            source_paths.join(", "),
            backend.describe(),
            id
        );

        match self.fill(env, backend, source_paths, &id, backup_timestamp, &dir) {
            Ok(record) => {
                if record.no_prior_state {
                    log_status!("backup", "No prior state on '{}'; recorded empty backup", env.name);
                }
                Ok(record)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(Error::snapshot_failed(&env.name, e.message))
            }
        }
    }

    fn fill(
        &self,
        env: &EnvironmentConfig,
        backend: &dyn DeployBackend,
        source_paths: &[String],
        id: &str,
        backup_timestamp: DateTime<Utc>,
        dir: &Path,
    ) -> Result<BackupRecord> {
        let archive_location = dir.join(ARCHIVE_FILE);
        let captured_paths = backend.existing_paths(source_paths)?;
        let no_prior_state = captured_paths.is_empty();

        if no_prior_state {
            archive::write_empty(&archive_location)?;
        } else {
            backend.capture(&captured_paths, &archive_location)?;
        }

        let record = BackupRecord {
            id: id.to_string(),
            backup_timestamp,
            environment_name: env.name.clone(),
            source_paths: source_paths.to_vec(),
            captured_paths,
            archive_location,
            no_prior_state,
        };

        let content = serde_json::to_string_pretty(&record).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize backup record".to_string()))
        })?;
        let record_path = dir.join(RECORD_FILE);
        fs::write(&record_path, content).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("write {}", record_path.display())))
        })?;

        Ok(record)
    }

    /// Put the target back to the state captured in `record`.
    ///
    /// Every path in `source_paths` is removed first, so paths that did not
    /// exist at snapshot time do not exist afterwards either.
    pub fn restore(
        &self,
        record: &BackupRecord,
        env: &EnvironmentConfig,
        backend: &dyn DeployBackend,
    ) -> Result<()> {
        let fail = |cause: String| Error::restore_failed(&env.name, &record.id, cause);

        if !record.archive_location.is_file() {
            return Err(fail(format!(
                "archive {} is missing",
                record.archive_location.display()
            )));
        }

        log_status!("rollback", "Restoring '{}' from backup {}", env.name, record.id);

        backend
            .remove_paths(&record.source_paths)
            .map_err(|e| fail(e.message))?;

        if record.no_prior_state {
            return Ok(());
        }

        let staged = backend
            .transfer(&record.archive_location)
            .map_err(|e| fail(e.message))?;
        backend.apply(&staged).map_err(|e| fail(e.message))?;
        Ok(())
    }

    /// Every completed backup of `environment`, newest first.
    pub fn list(&self, environment: &str) -> Result<Vec<BackupRecord>> {
        let root = self.layout.backups(environment);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&root).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", root.display())))
        })?;

        let mut records: Vec<BackupRecord> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join(RECORD_FILE))
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                serde_json::from_str::<BackupRecord>(&content).ok()
            })
            .collect();

        records.sort_by(|a, b| {
            b.backup_timestamp
                .cmp(&a.backup_timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    pub fn latest(&self, environment: &str) -> Result<BackupRecord> {
        self.list(environment)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::backup_not_found(environment, None))
    }

    pub fn find(&self, environment: &str, backup_id: &str) -> Result<BackupRecord> {
        self.list(environment)?
            .into_iter()
            .find(|record| record.id == backup_id)
            .ok_or_else(|| Error::backup_not_found(environment, Some(backup_id.to_string())))
    }
}

/// Create a fresh `<timestamp>` directory under `root`. Names are never
/// reused: on collision the timestamp moves forward.
fn claim_directory(root: &Path) -> Result<(String, DateTime<Utc>, PathBuf)> {
    let mut at = timestamp::now();
    for _ in 0..MAX_NAME_ATTEMPTS {
        let id = timestamp::backup_stamp(at);
        let dir = root.join(&id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((id, at, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                at = std::cmp::max(timestamp::now(), at + Duration::microseconds(1));
            }
            Err(e) => {
                return Err(Error::internal_io(
                    e.to_string(),
                    Some(format!("create {}", dir.display())),
                ))
            }
        }
    }
    Err(Error::internal_unexpected(format!(
        "could not allocate a backup directory under {}",
        root.display()
    )))
}
