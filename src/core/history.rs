use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::deploy::TaskReport;
use crate::error::{Error, Result};
use crate::health::OverallStatus;
use crate::paths::{self, StateLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Success,
    Failed,
    RolledBack,
}

/// One attempt to change an environment: a deploy or a rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub environment_name: String,
    pub artifact_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DeploymentOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
    /// Whether a confirmation token was accepted for this run.
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<OverallStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_deploy: Vec<TaskReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl DeploymentRecord {
    pub fn new(
        environment_name: &str,
        artifact_name: &str,
        started_at: DateTime<Utc>,
        backup_ref: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            environment_name: environment_name.to_string(),
            artifact_name: artifact_name.to_string(),
            started_at,
            finished_at: None,
            outcome: None,
            backup_ref,
            confirmed: false,
            health: None,
            post_deploy: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn finish(&mut self, outcome: DeploymentOutcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now().max(self.started_at));
    }

    /// Deployed successfully but the post-deploy health verdict was `Fail`.
    pub fn deployed_unhealthy(&self) -> bool {
        self.outcome == Some(DeploymentOutcome::Success) && self.health == Some(OverallStatus::Fail)
    }
}

/// Append-only store of deployment records under `stateDir/deployments/<env>/`.
pub struct DeploymentHistory {
    layout: StateLayout,
}

impl DeploymentHistory {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let dir = self.layout.deployments(&record.environment_name);
        paths::ensure_dir(&dir)?;

        let file = dir.join(format!(
            "{}-{}.json",
            record.started_at.format("%Y%m%dT%H%M%S%.6fZ"),
            record.id
        ));
        let content = serde_json::to_string_pretty(record).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize deployment record".to_string()))
        })?;
        fs::write(&file, content).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("write {}", file.display())))
        })
    }

    /// Records for `environment`, newest first.
    pub fn list(&self, environment: &str) -> Result<Vec<DeploymentRecord>> {
        let dir = self.layout.deployments(environment);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", dir.display())))
        })?;

        let mut records: Vec<DeploymentRecord> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                serde_json::from_str(&content).ok()
            })
            .collect();

        records.sort_by(|a: &DeploymentRecord, b: &DeploymentRecord| {
            b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }
}
