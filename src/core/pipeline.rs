//! Deployment run state machine.
//!
//! `Idle -> Resolving -> [AwaitingConfirmation] -> BackingUp -> Deploying ->
//! PostDeploy -> Verifying -> Completed | Failed | RolledBack`
//!
//! The controller is the only place that decides whether a failure is
//! retried, rolled back or reported. Components below it return errors and
//! structured results; they never restore on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::{BackupManager, BackupRecord};
use crate::build::BuildArtifact;
use crate::defaults::{DeployConfig, PostDeployFailurePolicy, PostDeployTaskConfig, StagehandConfig};
use crate::deploy::{DeploymentExecutor, PostDeployTask, TaskFailureMode, TaskReport};
use crate::environment::{EnvironmentConfig, EnvironmentRegistry};
use crate::error::{Error, ErrorCode, Result};
use crate::health::{CheckName, HealthReport, HealthVerifier, OverallStatus, ProbeTarget};
use crate::history::{DeploymentHistory, DeploymentOutcome, DeploymentRecord};
use crate::lock::DeployLock;
use crate::paths::StateLayout;
use crate::transport::{BackendFactory, DeployBackend};
use crate::utils::timestamp;

/// The only input that opens `AwaitingConfirmation`.
pub const CONFIRMATION_TOKEN: &str = "yes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resolving,
    AwaitingConfirmation,
    BackingUp,
    Deploying,
    PostDeploy,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Resolving => "resolving",
            RunState::AwaitingConfirmation => "awaiting_confirmation",
            RunState::BackingUp => "backing_up",
            RunState::Deploying => "deploying",
            RunState::PostDeploy => "post_deploy",
            RunState::Verifying => "verifying",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::RolledBack
        )
    }
}

/// Shared cancellation request, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Token supplied by the caller for protected environments.
    pub confirmation: Option<String>,
    pub auto_rollback: bool,
    pub post_deploy_failure: PostDeployFailurePolicy,
    pub health_checks: Vec<CheckName>,
    pub verify: bool,
}

impl RunOptions {
    pub fn from_config(config: &StagehandConfig) -> Self {
        Self {
            confirmation: None,
            auto_rollback: config.deploy.auto_rollback,
            post_deploy_failure: config.deploy.post_deploy_failure,
            health_checks: config.health.checks.clone(),
            verify: true,
        }
    }

    pub fn confirmed_with(mut self, token: Option<String>) -> Self {
        self.confirmation = token;
        self
    }
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPlan {
    pub environment: EnvironmentConfig,
    pub target: String,
    pub artifact: String,
    pub sha256: String,
    pub backup_paths: Vec<String>,
    pub post_deploy: Vec<String>,
    pub health_checks: Vec<CheckName>,
    pub confirmed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunReport {
    pub environment: String,
    pub artifact: String,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub error: Option<Error>,
}

impl PipelineRunReport {
    fn new(environment: &str, artifact: &str) -> Self {
        Self {
            environment: environment.to_string(),
            artifact: artifact.to_string(),
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            confirmed: false,
            backup: None,
            deployment: None,
            health: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        log_status!("pipeline", "{} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        self.transitions.push(state);
    }

    fn end(mut self, state: RunState, error: Option<Error>) -> Self {
        self.enter(state);
        self.error = error;
        self
    }

    /// Fail with the current stage recorded on the error.
    fn fail(self, error: Error) -> Self {
        let error = error.with_stage(self.state.as_str());
        self.end(RunState::Failed, Some(error))
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Completed, but the health verdict was `Fail`.
    pub fn deployed_unhealthy(&self) -> bool {
        self.deployment
            .as_ref()
            .is_some_and(DeploymentRecord::deployed_unhealthy)
    }

    pub fn backup_ref(&self) -> Option<&str> {
        self.backup.as_ref().map(|b| b.id.as_str())
    }
}

pub struct PipelineController {
    registry: EnvironmentRegistry,
    layout: StateLayout,
    factory: Box<dyn BackendFactory>,
    verifier: HealthVerifier,
    post_deploy: Vec<PostDeployTaskConfig>,
    command_timeout: Duration,
    cancel: CancelFlag,
}

impl PipelineController {
    pub fn new(
        registry: EnvironmentRegistry,
        layout: StateLayout,
        factory: Box<dyn BackendFactory>,
        verifier: HealthVerifier,
        deploy: &DeployConfig,
    ) -> Self {
        Self {
            registry,
            layout,
            factory,
            verifier,
            post_deploy: deploy.post_deploy.clone(),
            command_timeout: Duration::from_secs(deploy.command_timeout_secs),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    fn tasks_for(&self, env: &EnvironmentConfig) -> Vec<PostDeployTask> {
        env.post_deploy
            .as_ref()
            .unwrap_or(&self.post_deploy)
            .iter()
            .map(PostDeployTask::from)
            .collect()
    }

    fn confirm(env: &EnvironmentConfig, token: Option<&str>) -> Result<bool> {
        if !env.requires_confirmation {
            return Ok(false);
        }
        if token.map(str::trim) == Some(CONFIRMATION_TOKEN) {
            Ok(true)
        } else {
            Err(Error::confirmation_rejected(&env.name))
        }
    }

    /// Resolve and confirm only. Nothing is locked, captured or written.
    pub fn plan(&self, env_name: &str, artifact: &BuildArtifact, options: &RunOptions) -> Result<RunPlan> {
        let env = self.registry.resolve(env_name)?;
        let confirmed = Self::confirm(&env, options.confirmation.as_deref())?;

        let mut tasks = self.tasks_for(&env);
        tasks.sort_by_key(|task| task.kind);

        Ok(RunPlan {
            target: env.target_label(),
            artifact: artifact.name.clone(),
            sha256: artifact.sha256.clone(),
            backup_paths: env.backup_paths.clone(),
            post_deploy: tasks
                .iter()
                .map(|task| format!("{}: {}", task.kind.as_str(), task.command))
                .collect(),
            health_checks: if options.verify {
                options.health_checks.clone()
            } else {
                Vec::new()
            },
            confirmed,
            environment: env,
        })
    }

    /// Drive one deployment of `artifact` to `env_name` through every stage.
    ///
    /// Always returns a report; `report.error` holds the fatal error of a run
    /// that ended `Failed` or `RolledBack`.
    pub fn run(&self, env_name: &str, artifact: &BuildArtifact, options: &RunOptions) -> PipelineRunReport {
        let mut run = PipelineRunReport::new(env_name, &artifact.name);

        run.enter(RunState::Resolving);
        let env = match self.registry.resolve(env_name) {
            Ok(env) => env,
            Err(e) => return run.fail(e),
        };
        run.environment = env.name.clone();

        if env.requires_confirmation {
            run.enter(RunState::AwaitingConfirmation);
        }
        match Self::confirm(&env, options.confirmation.as_deref()) {
            Ok(confirmed) => run.confirmed = confirmed,
            Err(e) => return run.fail(e),
        }
        if self.cancel.is_cancelled() {
            let stage = run.state.as_str();
            return run.fail(Error::deploy_cancelled(&env.name, stage, None));
        }

        run.enter(RunState::BackingUp);
        let lock = match DeployLock::acquire(&self.layout, &env.name) {
            Ok(lock) => lock,
            Err(e) => return run.fail(e),
        };
        let backend = match self.factory.backend_for(&env) {
            Ok(backend) => backend,
            Err(e) => return run.fail(e),
        };
        let backups = BackupManager::new(self.layout.clone());
        let backup = match backups.snapshot(&env, backend.as_ref(), &env.backup_paths) {
            Ok(backup) => backup,
            Err(e) => return run.fail(e),
        };
        log_status!("pipeline", "Backup {} captured for '{}'", backup.id, env.name);
        run.backup = Some(backup.clone());

        if self.cancel.is_cancelled() {
            let err = Error::deploy_cancelled(&env.name, "backing_up", Some(backup.id.clone()));
            return run.fail(err);
        }

        let executor = DeploymentExecutor::new(
            Arc::clone(&backend),
            self.tasks_for(&env),
            self.command_timeout,
        );
        let mut record = executor.begin(artifact, &env, &backup);
        record.confirmed = run.confirmed;

        run.enter(RunState::Deploying);
        let delivered = executor
            .deliver(artifact, &env, &backup, &lock)
            .and_then(|()| {
                if self.cancel.is_cancelled() {
                    Err(Error::deploy_cancelled(&env.name, "deploying", Some(backup.id.clone())))
                } else {
                    Ok(())
                }
            });
        if let Err(err) = delivered {
            let restore = options.auto_rollback
                && (err.code.touches_target() || err.code == ErrorCode::DeployCancelled);
            let err = err.with_backup_ref(&env.name, &backup.id);
            return self.abandon(run, record, err, &env, backend.as_ref(), &backup, restore);
        }

        run.enter(RunState::PostDeploy);
        let mode = match options.post_deploy_failure {
            PostDeployFailurePolicy::Report => TaskFailureMode::Continue,
            PostDeployFailurePolicy::Rollback => TaskFailureMode::Stop,
        };
        record.post_deploy = executor.run_post_deploy(&env, mode);
        let failed_tasks: Vec<String> = record
            .post_deploy
            .iter()
            .filter(|report| report.failed())
            .map(TaskReport::summary)
            .collect();
        if !failed_tasks.is_empty() {
            match options.post_deploy_failure {
                PostDeployFailurePolicy::Report => {
                    record.diagnostics.extend(failed_tasks.iter().cloned());
                    run.warnings.extend(failed_tasks);
                }
                PostDeployFailurePolicy::Rollback => {
                    let err = Error::post_deploy_failed(&env.name, failed_tasks, Some(backup.id.clone()));
                    return self.abandon(run, record, err, &env, backend.as_ref(), &backup, true);
                }
            }
        }

        if options.verify {
            run.enter(RunState::Verifying);
            let target = ProbeTarget {
                environment: env.clone(),
                backend: Arc::clone(&backend),
            };
            let report = self.verifier.verify(&target, &options.health_checks);
            record.health = Some(report.overall);
            match report.overall {
                OverallStatus::Fail => {
                    let failed = report.failed_checks();
                    record
                        .diagnostics
                        .push(format!("deployed but unhealthy: {}", failed.join("; ")));
                    run.warnings.extend(failed);
                }
                OverallStatus::WarnOnly => run.warnings.extend(report.warned_checks()),
                OverallStatus::Pass => {}
            }
            run.health = Some(report);
        }

        if env.requires_confirmation && !record.confirmed {
            let err = Error::confirmation_rejected(&env.name);
            return self.abandon(run, record, err, &env, backend.as_ref(), &backup, true);
        }

        record.finish(DeploymentOutcome::Success);
        self.save(&mut run, record);
        drop(lock);
        run.end(RunState::Completed, None)
    }

    /// End a run whose target may have been changed. With `restore` the
    /// backup is put back and the run ends `RolledBack`; otherwise, or when
    /// the restore itself fails, it ends `Failed` with the recovery reference.
    #[allow(clippy::too_many_arguments)]
    fn abandon(
        &self,
        mut run: PipelineRunReport,
        mut record: DeploymentRecord,
        err: Error,
        env: &EnvironmentConfig,
        backend: &dyn DeployBackend,
        backup: &BackupRecord,
        restore: bool,
    ) -> PipelineRunReport {
        let err = err.with_stage(run.state.as_str());
        record.diagnostics.push(err.message.clone());

        if !restore {
            record.finish(DeploymentOutcome::Failed);
            self.save(&mut run, record);
            return run.end(RunState::Failed, Some(err));
        }

        log_status!("pipeline", "Rolling back '{}' to backup {}", env.name, backup.id);
        match BackupManager::new(self.layout.clone()).restore(backup, env, backend) {
            Ok(()) => {
                record.finish(DeploymentOutcome::RolledBack);
                self.save(&mut run, record);
                run.end(RunState::RolledBack, Some(err))
            }
            Err(restore_err) => {
                record.diagnostics.push(restore_err.message.clone());
                record.finish(DeploymentOutcome::Failed);
                self.save(&mut run, record);
                run.warnings.push(err.message);
                let restore_err = restore_err.with_stage(run.state.as_str());
                run.end(RunState::Failed, Some(restore_err))
            }
        }
    }

    fn save(&self, run: &mut PipelineRunReport, record: DeploymentRecord) {
        if let Err(e) = DeploymentHistory::new(self.layout.clone()).save(&record) {
            run.warnings
                .push(format!("deployment record not saved: {}", e.message));
        }
        run.deployment = Some(record);
    }

    /// Restore `env_name` from a backup (the newest unless `backup_id` names
    /// one) and record the restore as a `RolledBack` deployment.
    ///
    /// No snapshot is taken first, so repeating a rollback restores the same
    /// state again.
    pub fn rollback(
        &self,
        env_name: &str,
        backup_id: Option<&str>,
        confirmation: Option<&str>,
    ) -> Result<DeploymentRecord> {
        let env = self.registry.resolve(env_name)?;
        let confirmed = Self::confirm(&env, confirmation)?;
        let _lock = DeployLock::acquire(&self.layout, &env.name)?;
        let backend = self.factory.backend_for(&env)?;

        let backups = BackupManager::new(self.layout.clone());
        let backup = match backup_id {
            Some(id) => backups.find(&env.name, id)?,
            None => backups.latest(&env.name)?,
        };

        let mut record = DeploymentRecord::new(
            &env.name,
            &format!("backup:{}", backup.id),
            timestamp::now(),
            Some(backup.id.clone()),
        );
        record.confirmed = confirmed;

        let restored = backups.restore(&backup, &env, backend.as_ref());
        let history = DeploymentHistory::new(self.layout.clone());
        match restored {
            Ok(()) => {
                record.finish(DeploymentOutcome::RolledBack);
                history.save(&record)?;
                log_status!("rollback", "'{}' restored from {}", env.name, backup.id);
                Ok(record)
            }
            Err(e) => {
                record.diagnostics.push(e.message.clone());
                record.finish(DeploymentOutcome::Failed);
                if let Err(save_err) = history.save(&record) {
                    log_status!("rollback", "Could not record failed rollback: {}", save_err.message);
                }
                Err(e)
            }
        }
    }

    /// Run health checks against an environment outside a deployment.
    pub fn health_check(&self, env_name: &str, checks: &[CheckName]) -> Result<HealthReport> {
        let env = self.registry.resolve(env_name)?;
        let backend = self.factory.backend_for(&env)?;
        Ok(self.verifier.verify(
            &ProbeTarget {
                environment: env,
                backend,
            },
            checks,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{ArtifactBuilder, BuildOptions, ShellStepRunner};
    use crate::defaults::EnvironmentEntry;
    use crate::git::SourceInfo;
    use crate::transport::TransportFactory;
    use crate::utils::archive::ExcludeSet;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        source: TempDir,
        site: TempDir,
        state: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                source: TempDir::new().unwrap(),
                site: TempDir::new().unwrap(),
                state: TempDir::new().unwrap(),
            };
            fs::write(fx.source.path().join("index.php"), "new").unwrap();
            fs::create_dir_all(fx.site.path().join("staging")).unwrap();
            fs::create_dir_all(fx.site.path().join("production")).unwrap();
            fs::write(fx.site.path().join("production/index.php"), "old").unwrap();
            fx
        }

        fn config(&self) -> StagehandConfig {
            let mut config = crate::defaults::builtin_defaults();
            for name in ["staging", "production"] {
                config.environments.insert(
                    name.to_string(),
                    EnvironmentEntry {
                        host: Some("localhost".to_string()),
                        path: Some(self.site.path().join(name).to_string_lossy().to_string()),
                        ..Default::default()
                    },
                );
            }
            config
        }

        fn controller(&self) -> PipelineController {
            let config = self.config();
            let layout = StateLayout::new(self.state.path());
            let registry =
                EnvironmentRegistry::from_sources(&config, &BTreeMap::new(), self.site.path()).unwrap();
            PipelineController::new(
                registry,
                layout.clone(),
                Box::new(TransportFactory::new(layout, Duration::from_secs(10))),
                HealthVerifier::standard(&config.health),
                &config.deploy,
            )
        }

        fn artifact(&self) -> BuildArtifact {
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
                    revision: "0123456789abcdef".to_string(),
                    branch: "main".to_string(),
                })
                .build(&[])
                .unwrap()
                .artifact
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                verify: false,
                ..RunOptions::from_config(&self.config())
            }
        }
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn unconfirmed_production_run_fails_without_side_effects() {
        let fx = Fixture::new();
        let report = fx.controller().run("production", &fx.artifact(), &fx.options());

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(
            report.transitions,
            vec![
                RunState::Idle,
                RunState::Resolving,
                RunState::AwaitingConfirmation,
                RunState::Failed
            ]
        );
        let err = report.error.unwrap();
        assert_eq!(err.code, ErrorCode::DeployConfirmationRejected);
        assert!(report.backup.is_none());
        assert!(report.deployment.is_none());
        assert_eq!(read(&fx.site.path().join("production/index.php")), "old");
        assert!(!fx.state.path().join("backups").exists());
        assert!(!fx.state.path().join("locks").exists());
    }

    #[test]
    fn wrong_token_is_rejected() {
        let fx = Fixture::new();
        let options = fx.options().confirmed_with(Some("y".to_string()));
        let report = fx.controller().run("production", &fx.artifact(), &options);
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(read(&fx.site.path().join("production/index.php")), "old");
    }

    #[test]
    fn confirmed_production_run_completes() {
        let fx = Fixture::new();
        let options = fx.options().confirmed_with(Some("yes".to_string()));
        let report = fx.controller().run("production", &fx.artifact(), &options);

        assert!(report.succeeded(), "{:?}", report.error);
        let record = report.deployment.unwrap();
        assert!(record.confirmed);
        assert_eq!(record.outcome, Some(DeploymentOutcome::Success));
        assert_eq!(read(&fx.site.path().join("production/index.php")), "new");
    }

    #[test]
    fn cancelled_run_stops_before_backup() {
        let fx = Fixture::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = fx
            .controller()
            .with_cancel(cancel)
            .run("staging", &fx.artifact(), &fx.options());

        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.error.unwrap().code, ErrorCode::DeployCancelled);
        assert!(report.backup.is_none());
    }

    #[test]
    fn plan_touches_nothing() {
        let fx = Fixture::new();
        let plan = fx
            .controller()
            .plan("staging", &fx.artifact(), &fx.options())
            .unwrap();
        assert_eq!(plan.backup_paths, vec![".".to_string()]);
        assert!(!plan.confirmed);
        assert!(!fx.state.path().join("backups").exists());

        let err = fx
            .controller()
            .plan("production", &fx.artifact(), &fx.options())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DeployConfirmationRejected);
    }

    #[test]
    fn rollback_without_backups_reports_not_found() {
        let fx = Fixture::new();
        let err = fx.controller().rollback("staging", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::BackupNotFound);
    }
}
