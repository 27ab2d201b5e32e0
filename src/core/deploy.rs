use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backup::BackupRecord;
use crate::build::{self, BuildArtifact};
use crate::defaults::PostDeployTaskConfig;
use crate::environment::EnvironmentConfig;
use crate::error::{Error, Result};
use crate::history::{DeploymentOutcome, DeploymentRecord};
use crate::lock::DeployLock;
use crate::transport::DeployBackend;
use crate::utils::timestamp;

const OUTPUT_TAIL_LINES: usize = 15;

/// Post-deploy task kinds. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostDeployKind {
    SchemaUpdate,
    CacheInvalidation,
    CacheWarm,
}

impl PostDeployKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostDeployKind::SchemaUpdate => "schema_update",
            PostDeployKind::CacheInvalidation => "cache_invalidation",
            PostDeployKind::CacheWarm => "cache_warm",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostDeployTask {
    pub kind: PostDeployKind,
    pub command: String,
}

impl From<&PostDeployTaskConfig> for PostDeployTask {
    fn from(config: &PostDeployTaskConfig) -> Self {
        Self {
            kind: config.kind,
            command: config.command.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub kind: PostDeployKind,
    pub command: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskReport {
    pub fn failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::TimedOut)
    }

    pub fn summary(&self) -> String {
        match &self.detail {
            Some(detail) => format!("{} {:?}: {}", self.kind.as_str(), self.status, detail),
            None => format!("{} {:?}", self.kind.as_str(), self.status),
        }
    }
}

/// Behaviour of the post-deploy phase after a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailureMode {
    /// Run the remaining tasks anyway.
    Continue,
    /// Skip the remaining tasks.
    Stop,
}

/// The only component that writes to a deployed environment.
pub struct DeploymentExecutor {
    backend: Arc<dyn DeployBackend>,
    tasks: Vec<PostDeployTask>,
    command_timeout: Duration,
}

impl DeploymentExecutor {
    pub fn new(
        backend: Arc<dyn DeployBackend>,
        mut tasks: Vec<PostDeployTask>,
        command_timeout: Duration,
    ) -> Self {
        tasks.sort_by_key(|task| task.kind);
        Self {
            backend,
            tasks,
            command_timeout,
        }
    }

    /// Open the deployment record. `started_at` is strictly after the
    /// backup it depends on.
    pub fn begin(
        &self,
        artifact: &BuildArtifact,
        env: &EnvironmentConfig,
        backup: &BackupRecord,
    ) -> DeploymentRecord {
        DeploymentRecord::new(
            &env.name,
            &artifact.name,
            timestamp::strictly_after(backup.backup_timestamp),
            Some(backup.id.clone()),
        )
    }

    /// Verify integrity, transfer and apply. Transfer and apply failures carry
    /// the backup reference; nothing is restored here.
    pub fn deliver(
        &self,
        artifact: &BuildArtifact,
        env: &EnvironmentConfig,
        backup: &BackupRecord,
        lock: &DeployLock,
    ) -> Result<()> {
        if lock.environment() != env.name {
            return Err(Error::internal_unexpected(format!(
                "lock for '{}' does not cover '{}'",
                lock.environment(),
                env.name
            )));
        }

        build::verify_integrity(artifact).map_err(|e| e.with_stage("deploying"))?;
        log_status!("deploy", "Artifact {} verified", artifact.name);

        log_status!("deploy", "Transferring {} to {}", artifact.name, self.backend.describe());
        let staged = self.backend.transfer(&artifact.path).map_err(|e| {
            Error::transfer_failed(&env.name, e.message, Some(backup.id.clone()))
        })?;

        log_status!("deploy", "Applying {} on '{}'", artifact.name, env.name);
        self.backend.apply(&staged).map_err(|e| {
            Error::apply_failed(&env.name, e.message, Some(backup.id.clone()))
        })?;

        Ok(())
    }

    /// Run post-deploy tasks in their fixed order.
    pub fn run_post_deploy(&self, env: &EnvironmentConfig, mode: TaskFailureMode) -> Vec<TaskReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        let mut halted = false;

        for task in &self.tasks {
            if halted {
                reports.push(TaskReport {
                    kind: task.kind,
                    command: task.command.clone(),
                    status: TaskStatus::Skipped,
                    exit_code: None,
                    duration_ms: 0,
                    detail: Some("skipped after earlier failure".to_string()),
                });
                continue;
            }

            log_status!("deploy", "post-deploy {}> {}", task.kind.as_str(), task.command);
            let started = Instant::now();
            let output = self.backend.run(&task.command, self.command_timeout);
            let duration_ms = started.elapsed().as_millis() as u64;

            let report = if output.success {
                TaskReport {
                    kind: task.kind,
                    command: task.command.clone(),
                    status: TaskStatus::Succeeded,
                    exit_code: Some(output.exit_code),
                    duration_ms,
                    detail: None,
                }
            } else if output.timed_out {
                TaskReport {
                    kind: task.kind,
                    command: task.command.clone(),
                    status: TaskStatus::TimedOut,
                    exit_code: None,
                    duration_ms,
                    detail: Some(format!(
                        "timed out after {}s",
                        self.command_timeout.as_secs()
                    )),
                }
            } else {
                TaskReport {
                    kind: task.kind,
                    command: task.command.clone(),
                    status: TaskStatus::Failed,
                    exit_code: Some(output.exit_code),
                    duration_ms,
                    detail: Some(output.tail(OUTPUT_TAIL_LINES)),
                }
            };

            if report.failed() {
                log_status!(
                    "deploy",
                    "post-deploy {} failed on '{}'",
                    task.kind.as_str(),
                    env.name
                );
                halted = mode == TaskFailureMode::Stop;
            }
            reports.push(report);
        }

        reports
    }

    /// Begin, deliver and run every post-deploy task. Task failures are
    /// recorded on the returned record; deciding what they mean is the
    /// caller's job.
    pub fn execute(
        &self,
        artifact: &BuildArtifact,
        env: &EnvironmentConfig,
        backup: &BackupRecord,
        lock: &DeployLock,
    ) -> Result<DeploymentRecord> {
        let mut record = self.begin(artifact, env, backup);
        self.deliver(artifact, env, backup, lock)?;

        record.post_deploy = self.run_post_deploy(env, TaskFailureMode::Continue);
        record.diagnostics.extend(
            record
                .post_deploy
                .iter()
                .filter(|report| report.failed())
                .map(TaskReport::summary),
        );
        record.finish(DeploymentOutcome::Success);
        Ok(record)
    }
}
