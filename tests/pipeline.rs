mod common;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use common::{tree, write, FlakyFactory, Site, Trip};
use stagehand::backup::BackupManager;
use stagehand::defaults::{PostDeployFailurePolicy, PostDeployTaskConfig};
use stagehand::deploy::{PostDeployKind, TaskStatus};
use stagehand::environment::EnvironmentRegistry;
use stagehand::health::{CheckName, CheckOutcome, HealthCheck, HealthVerifier, OverallStatus, ProbeTarget};
use stagehand::history::{DeploymentHistory, DeploymentOutcome};
use stagehand::lock::DeployLock;
use stagehand::pipeline::RunState;
use stagehand::ErrorCode;

struct Verdict(CheckOutcome);

impl HealthCheck for Verdict {
    fn run(&self, _target: &ProbeTarget, _timeout: Duration) -> CheckOutcome {
        self.0.clone()
    }
}

#[test]
fn resolving_twice_yields_identical_config() {
    let site = Site::new();
    let vars: BTreeMap<String, String> = [
        ("STAGEHAND_STAGING_HOST", "stage.example.org"),
        ("STAGEHAND_STAGING_USER", "deploy"),
        ("STAGEHAND_STAGING_PATH", "/srv/wiki"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let registry = EnvironmentRegistry::from_sources(&site.config, &vars, site.targets.path()).unwrap();

    let first = registry.resolve("staging").unwrap();
    let second = registry.resolve("STAGING").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.host, "stage.example.org");
    assert!(!first.requires_confirmation);
    assert!(registry.resolve("production").unwrap().requires_confirmation);
    assert_eq!(
        registry.resolve("qa").unwrap_err().code,
        ErrorCode::EnvironmentUnknown
    );
}

#[test]
fn successful_deploy_is_preceded_by_its_backup() {
    let site = Site::new();
    let report = site.controller().run("staging", &site.artifact(), &site.options());

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(
        report.transitions,
        vec![
            RunState::Idle,
            RunState::Resolving,
            RunState::BackingUp,
            RunState::Deploying,
            RunState::PostDeploy,
            RunState::Completed
        ]
    );

    let backup = report.backup.as_ref().unwrap();
    let record = report.deployment.as_ref().unwrap();
    assert_eq!(record.outcome, Some(DeploymentOutcome::Success));
    assert_eq!(record.backup_ref.as_deref(), Some(backup.id.as_str()));
    assert_eq!(backup.environment_name, "staging");
    assert!(backup.backup_timestamp < record.started_at);

    let stored = DeploymentHistory::new(site.layout()).list("staging").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, record.id);
}

#[test]
fn first_deploy_to_empty_target_succeeds_with_empty_backup() {
    let site = Site::new();
    std::fs::remove_dir_all(site.root("staging")).unwrap();

    let report = site.controller().run("staging", &site.artifact(), &site.options());
    assert!(report.succeeded(), "{:?}", report.error);
    assert!(report.backup.unwrap().no_prior_state);
    assert!(site.root("staging").join("index.php").is_file());
}

#[test]
fn production_without_token_fails_and_touches_nothing() {
    let site = Site::new();
    let before = tree(&site.root("production"));

    let report = site.controller().run("production", &site.artifact(), &site.options());

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.error.as_ref().unwrap().code,
        ErrorCode::DeployConfirmationRejected
    );
    assert!(report.deployment.is_none());
    assert_eq!(tree(&site.root("production")), before);
    assert!(BackupManager::new(site.layout()).list("production").unwrap().is_empty());
    assert!(DeploymentHistory::new(site.layout()).list("production").unwrap().is_empty());
}

#[test]
fn apply_failure_rolls_back_to_exact_backup() {
    let site = Site::new();
    let before = tree(&site.root("staging"));
    let factory = FlakyFactory {
        inner: site.factory(),
        armed: Arc::new(AtomicBool::new(true)),
    };
    let controller = site.controller_with(Box::new(factory), HealthVerifier::new(Duration::from_secs(1)));

    let report = controller.run("staging", &site.artifact(), &site.options());

    assert_eq!(report.state, RunState::RolledBack);
    let err = report.error.as_ref().unwrap();
    assert_eq!(err.code, ErrorCode::DeployApplyFailed);
    assert_eq!(err.stage(), Some("deploying"));
    assert_eq!(err.backup_ref(), report.backup_ref());
    assert_eq!(
        report.deployment.as_ref().unwrap().outcome,
        Some(DeploymentOutcome::RolledBack)
    );
    assert_eq!(tree(&site.root("staging")), before);
}

#[test]
fn apply_failure_without_auto_rollback_reports_recovery_command() {
    let site = Site::new();
    let factory = FlakyFactory {
        inner: site.factory(),
        armed: Arc::new(AtomicBool::new(true)),
    };
    let controller = site.controller_with(Box::new(factory), HealthVerifier::new(Duration::from_secs(1)));
    let mut options = site.options();
    options.auto_rollback = false;

    let report = controller.run("staging", &site.artifact(), &options);

    assert_eq!(report.state, RunState::Failed);
    let err = report.error.as_ref().unwrap();
    let backup_id = report.backup_ref().unwrap();
    assert!(err
        .hints
        .iter()
        .any(|h| h.message.contains(&format!("stagehand rollback staging --backup {}", backup_id))));
    assert_eq!(
        report.deployment.as_ref().unwrap().outcome,
        Some(DeploymentOutcome::Failed)
    );

    // The recorded backup still restores the pre-deploy tree.
    let record = controller.rollback("staging", Some(backup_id), None).unwrap();
    assert_eq!(record.outcome, Some(DeploymentOutcome::RolledBack));
    assert_eq!(
        std::fs::read_to_string(site.root("staging").join("index.php")).unwrap(),
        "<?php echo 'v1';"
    );
}

#[test]
fn unhealthy_deploy_completes_but_is_tagged() {
    let site = Site::new();
    let mut options = site.options();
    options.verify = true;
    options.health_checks = vec![CheckName::Runtime, CheckName::Connectivity];

    let failing = site.controller_with(
        Box::new(site.factory()),
        HealthVerifier::new(Duration::from_secs(2))
            .with_check(CheckName::Runtime, Verdict(CheckOutcome::fail("php not found")))
            .with_check(CheckName::Connectivity, Verdict(CheckOutcome::pass("200"))),
    );
    let unhealthy = failing.run("staging", &site.artifact(), &options);
    assert_eq!(unhealthy.state, RunState::Completed);
    assert!(unhealthy.deployed_unhealthy());
    let record = unhealthy.deployment.as_ref().unwrap();
    assert_eq!(record.health, Some(OverallStatus::Fail));
    assert!(record.diagnostics.iter().any(|d| d.contains("deployed but unhealthy")));

    let passing = site.controller_with(
        Box::new(site.factory()),
        HealthVerifier::new(Duration::from_secs(2))
            .with_check(CheckName::Runtime, Verdict(CheckOutcome::pass("PHP 8.2")))
            .with_check(CheckName::Connectivity, Verdict(CheckOutcome::pass("200"))),
    );
    let healthy = passing.run("staging", &site.artifact(), &options);
    assert_eq!(healthy.state, RunState::Completed);
    assert!(!healthy.deployed_unhealthy());
    assert_eq!(healthy.health.unwrap().overall, OverallStatus::Pass);
}

#[test]
fn rollback_twice_restores_the_same_state() {
    let site = Site::new();
    let before = tree(&site.root("staging"));
    let controller = site.controller();

    let report = controller.run("staging", &site.artifact(), &site.options());
    assert!(report.succeeded(), "{:?}", report.error);
    assert_ne!(tree(&site.root("staging")), before);

    let first = controller.rollback("staging", None, None).unwrap();
    let after_first = tree(&site.root("staging"));
    let second = controller.rollback("staging", None, None).unwrap();
    let after_second = tree(&site.root("staging"));

    assert_eq!(after_first, before);
    assert_eq!(after_second, after_first);
    assert_eq!(first.backup_ref, second.backup_ref);
    assert_ne!(first.id, second.id);
    assert_eq!(second.outcome, Some(DeploymentOutcome::RolledBack));

    let history = DeploymentHistory::new(site.layout()).list("staging").unwrap();
    assert_eq!(history.len(), 3);
}

#[test]
fn rollback_can_target_an_older_backup() {
    let site = Site::new();
    let original = tree(&site.root("staging"));
    let controller = site.controller();

    assert!(controller.run("staging", &site.artifact(), &site.options()).succeeded());
    write(site.source.path(), "index.php", "<?php echo 'v3';");
    assert!(controller.run("staging", &site.artifact(), &site.options()).succeeded());

    let backups = BackupManager::new(site.layout()).list("staging").unwrap();
    assert_eq!(backups.len(), 2);
    let oldest = backups.last().unwrap();

    controller.rollback("staging", Some(&oldest.id), None).unwrap();
    assert_eq!(tree(&site.root("staging")), original);
}

#[test]
fn concurrent_deploy_is_rejected() {
    let site = Site::new();
    let _held = DeployLock::acquire(&site.layout(), "staging").unwrap();

    let report = site.controller().run("staging", &site.artifact(), &site.options());

    assert_eq!(report.state, RunState::Failed);
    let err = report.error.unwrap();
    assert_eq!(err.code, ErrorCode::DeployInProgress);
    assert_eq!(err.retryable, Some(true));
    assert!(report.backup.is_none());
}

#[test]
fn post_deploy_failure_follows_policy() {
    let mut site = Site::new();
    site.config.deploy.post_deploy = vec![
        PostDeployTaskConfig {
            kind: PostDeployKind::CacheWarm,
            command: "echo warmed > warmed.txt".to_string(),
        },
        PostDeployTaskConfig {
            kind: PostDeployKind::SchemaUpdate,
            command: "exit 7".to_string(),
        },
    ];

    let report = site.controller().run("staging", &site.artifact(), &site.options());
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.warnings.len(), 1);
    let tasks = &report.deployment.as_ref().unwrap().post_deploy;
    assert_eq!(tasks[0].kind, PostDeployKind::SchemaUpdate);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[1].status, TaskStatus::Succeeded);

    let before = tree(&site.root("production"));
    let mut options = site.options();
    options.post_deploy_failure = PostDeployFailurePolicy::Rollback;
    options.confirmation = Some("yes".to_string());
    let report = site.controller().run("production", &site.artifact(), &options);

    assert_eq!(report.state, RunState::RolledBack);
    assert_eq!(
        report.error.as_ref().unwrap().code,
        ErrorCode::DeployPostDeployFailed
    );
    let tasks = &report.deployment.as_ref().unwrap().post_deploy;
    assert_eq!(tasks[1].status, TaskStatus::Skipped);
    assert_eq!(tree(&site.root("production")), before);
}

#[test]
fn environment_post_deploy_override_replaces_global_tasks() {
    let mut site = Site::new();
    site.config.deploy.post_deploy = vec![PostDeployTaskConfig {
        kind: PostDeployKind::CacheWarm,
        command: "exit 1".to_string(),
    }];
    if let Some(entry) = site.config.environments.get_mut("staging") {
        entry.post_deploy = Some(vec![PostDeployTaskConfig {
            kind: PostDeployKind::CacheInvalidation,
            command: "true".to_string(),
        }]);
    }

    let report = site.controller().run("staging", &site.artifact(), &site.options());
    assert!(report.succeeded());
    assert!(report.warnings.is_empty());
    let tasks = &report.deployment.unwrap().post_deploy;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, PostDeployKind::CacheInvalidation);
}

#[test]
fn cancel_during_backup_fails_with_recovery_ref_and_untouched_target() {
    let site = Site::new();
    let before = tree(&site.root("staging"));
    let controller = site.tripwire_controller(Trip::Capture);

    let report = controller.run("staging", &site.artifact(), &site.options());
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.transitions.last(), Some(&RunState::Failed));
    assert!(!report.transitions.contains(&RunState::Deploying));

    let err = report.error.as_ref().unwrap();
    assert_eq!(err.code, ErrorCode::DeployCancelled);
    assert!(report.backup_ref().is_some());
    assert_eq!(err.backup_ref(), report.backup_ref());
    assert_eq!(tree(&site.root("staging")), before);

    let backups = BackupManager::new(site.layout()).list("staging").unwrap();
    assert_eq!(backups.len(), 1);
    DeployLock::acquire(&site.layout(), "staging").unwrap();
}

#[test]
fn cancel_during_delivery_rolls_back_when_enabled() {
    let site = Site::new();
    let before = tree(&site.root("staging"));
    let controller = site.tripwire_controller(Trip::Transfer);

    let report = controller.run("staging", &site.artifact(), &site.options());
    assert_eq!(report.state, RunState::RolledBack);
    assert_eq!(report.error.as_ref().unwrap().code, ErrorCode::DeployCancelled);
    assert_eq!(tree(&site.root("staging")), before);
}

#[test]
fn cancel_during_delivery_without_auto_rollback_leaves_recovery_ref() {
    let site = Site::new();
    let before = tree(&site.root("staging"));
    let controller = site.tripwire_controller(Trip::Transfer);
    let mut options = site.options();
    options.auto_rollback = false;

    let report = controller.run("staging", &site.artifact(), &options);
    assert_eq!(report.state, RunState::Failed);
    let err = report.error.as_ref().unwrap();
    assert_eq!(err.code, ErrorCode::DeployCancelled);
    let backup_ref = err.backup_ref().unwrap().to_string();
    assert_eq!(Some(backup_ref.as_str()), report.backup_ref());
    assert!(err.hints.iter().any(|hint| hint.message.contains(&backup_ref)));

    controller.rollback("staging", Some(&backup_ref), None).unwrap();
    assert_eq!(tree(&site.root("staging")), before);
}

#[cfg(unix)]
#[test]
fn rollback_restores_symlinked_directories() {
    let site = Site::new();
    let shared = tempfile::TempDir::new().unwrap();
    write(shared.path(), "avatar.png", "shared-bytes");
    let uploads = site.root("staging").join("uploads");
    std::os::unix::fs::symlink(shared.path(), &uploads).unwrap();

    // The release ships a real directory where the target had a link.
    write(site.source.path(), "uploads/README", "placeholder");
    let controller = site.controller();
    let report = controller.run("staging", &site.artifact(), &site.options());
    assert!(report.succeeded(), "{:?}", report.error);
    assert!(!std::fs::symlink_metadata(&uploads).unwrap().file_type().is_symlink());

    controller.rollback("staging", None, None).unwrap();
    assert_eq!(std::fs::read_link(&uploads).unwrap(), shared.path());
    assert_eq!(
        std::fs::read_to_string(shared.path().join("avatar.png")).unwrap(),
        "shared-bytes"
    );
    assert!(!shared.path().join("README").exists());
}
