use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidJson,
    ConfigInvalidValue,
    EnvironmentUnknown,

    ValidationInvalidArgument,

    BuildStepFailed,
    BuildArtifactExists,
    BuildArtifactNotFound,
    BuildIntegrityMismatch,

    BackupSnapshotFailed,
    BackupRestoreFailed,
    BackupNotFound,

    DeployTransferFailed,
    DeployApplyFailed,
    DeployInProgress,
    DeployConfirmationRejected,
    DeployCancelled,
    DeployPostDeployFailed,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    HealthCheckFailed,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::EnvironmentUnknown => "environment.unknown",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::BuildStepFailed => "build.step_failed",
            ErrorCode::BuildArtifactExists => "build.artifact_exists",
            ErrorCode::BuildArtifactNotFound => "build.artifact_not_found",
            ErrorCode::BuildIntegrityMismatch => "build.integrity_mismatch",

            ErrorCode::BackupSnapshotFailed => "backup.snapshot_failed",
            ErrorCode::BackupRestoreFailed => "backup.restore_failed",
            ErrorCode::BackupNotFound => "backup.not_found",

            ErrorCode::DeployTransferFailed => "deploy.transfer_failed",
            ErrorCode::DeployApplyFailed => "deploy.apply_failed",
            ErrorCode::DeployInProgress => "deploy.in_progress",
            ErrorCode::DeployConfirmationRejected => "deploy.confirmation_rejected",
            ErrorCode::DeployCancelled => "deploy.cancelled",
            ErrorCode::DeployPostDeployFailed => "deploy.post_deploy_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::HealthCheckFailed => "health.check_failed",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Failures that leave the target in a state only a restore can undo.
    pub fn touches_target(&self) -> bool {
        matches!(
            self,
            ErrorCode::DeployTransferFailed | ErrorCode::DeployApplyFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidJsonDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownEnvironmentDetails {
    pub name: String,
    pub known: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStepFailedDetails {
    pub stage: String,
    pub step: String,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailureDetails {
    pub stage: String,
    pub environment: String,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalJsonErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub target: TargetDetails,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

fn recovery_hint(environment: &str, backup_ref: &str) -> String {
    format!(
        "Manual restore required using backup {}: stagehand rollback {} --backup {}",
        backup_ref, environment, backup_ref
    )
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let key = key.into();
        let details = to_details(ConfigMissingKeyDetails {
            key: key.clone(),
            path,
        });

        Self::new(
            ErrorCode::ConfigMissingKey,
            format!("Missing required configuration key '{}'", key),
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        let details = to_details(ConfigInvalidJsonDetails {
            path: path.into(),
            error: err.to_string(),
        });

        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.clone(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid configuration value: {}", problem),
            details,
        )
    }

    pub fn environment_unknown(name: impl Into<String>, known: Vec<String>) -> Self {
        let name = name.into();
        let details = to_details(UnknownEnvironmentDetails {
            name: name.clone(),
            known,
        });

        Self::new(
            ErrorCode::EnvironmentUnknown,
            format!("Unknown environment '{}'", name),
            details,
        )
        .with_hint("Run 'stagehand env list' to see configured environments")
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            details,
        )
    }

    pub fn build_step_failed(
        step: impl Into<String>,
        cause: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        let step = step.into();
        let cause = cause.into();
        let details = to_details(BuildStepFailedDetails {
            stage: "build".to_string(),
            step: step.clone(),
            cause: cause.clone(),
            exit_code,
        });

        Self::new(
            ErrorCode::BuildStepFailed,
            format!("Build step '{}' failed: {}", step, cause),
            details,
        )
    }

    pub fn artifact_exists(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::BuildArtifactExists,
            format!("Artifact '{}' already exists", name),
            serde_json::json!({ "stage": "build", "artifact": name }),
        )
        .with_hint("Re-run with --overwrite to replace the existing artifact")
    }

    pub fn artifact_not_found(reference: impl Into<String>) -> Self {
        let reference = reference.into();
        Self::new(
            ErrorCode::BuildArtifactNotFound,
            format!("Artifact not found: {}", reference),
            serde_json::json!({ "artifact": reference }),
        )
        .with_hint("Run 'stagehand build' first, or pass --artifact <path>")
    }

    pub fn integrity_mismatch(
        artifact: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        let artifact = artifact.into();
        Self::new(
            ErrorCode::BuildIntegrityMismatch,
            format!("Artifact '{}' does not match its manifest checksum", artifact),
            serde_json::json!({
                "stage": "deploying",
                "artifact": artifact,
                "expected": expected.into(),
                "actual": actual.into(),
            }),
        )
    }

    pub fn snapshot_failed(environment: impl Into<String>, cause: impl Into<String>) -> Self {
        let environment = environment.into();
        let cause = cause.into();
        let details = to_details(StageFailureDetails {
            stage: "backing_up".to_string(),
            environment: environment.clone(),
            cause: cause.clone(),
            backup_ref: None,
        });

        Self::new(
            ErrorCode::BackupSnapshotFailed,
            format!("Backup of '{}' failed: {}", environment, cause),
            details,
        )
    }

    pub fn restore_failed(
        environment: impl Into<String>,
        backup_ref: impl Into<String>,
        cause: impl Into<String>,
    ) -> Self {
        let environment = environment.into();
        let backup_ref = backup_ref.into();
        let cause = cause.into();
        let hint = recovery_hint(&environment, &backup_ref);
        let details = to_details(StageFailureDetails {
            stage: "restoring".to_string(),
            environment: environment.clone(),
            cause: cause.clone(),
            backup_ref: Some(backup_ref.clone()),
        });

        Self::new(
            ErrorCode::BackupRestoreFailed,
            format!(
                "Restore of '{}' from backup {} failed: {}",
                environment, backup_ref, cause
            ),
            details,
        )
        .with_hint(hint)
    }

    pub fn backup_not_found(environment: impl Into<String>, backup_ref: Option<String>) -> Self {
        let environment = environment.into();
        let message = match &backup_ref {
            Some(id) => format!("Backup {} not found for '{}'", id, environment),
            None => format!("No backups recorded for '{}'", environment),
        };
        Self::new(
            ErrorCode::BackupNotFound,
            message,
            serde_json::json!({ "environment": environment, "backupRef": backup_ref }),
        )
        .with_hint(format!(
            "Run 'stagehand backups {}' to list available backups",
            environment
        ))
    }

    pub fn transfer_failed(
        environment: impl Into<String>,
        cause: impl Into<String>,
        backup_ref: Option<String>,
    ) -> Self {
        Self::stage_failure(
            ErrorCode::DeployTransferFailed,
            "deploying",
            "Transfer",
            environment.into(),
            cause.into(),
            backup_ref,
        )
    }

    pub fn apply_failed(
        environment: impl Into<String>,
        cause: impl Into<String>,
        backup_ref: Option<String>,
    ) -> Self {
        Self::stage_failure(
            ErrorCode::DeployApplyFailed,
            "deploying",
            "Apply",
            environment.into(),
            cause.into(),
            backup_ref,
        )
    }

    pub fn post_deploy_failed(
        environment: impl Into<String>,
        failed: Vec<String>,
        backup_ref: Option<String>,
    ) -> Self {
        Self::stage_failure(
            ErrorCode::DeployPostDeployFailed,
            "post_deploy",
            "Deploy",
            environment.into(),
            failed.join("; "),
            backup_ref,
        )
    }

    pub fn deploy_cancelled(
        environment: impl Into<String>,
        stage: impl Into<String>,
        backup_ref: Option<String>,
    ) -> Self {
        let stage = stage.into();
        Self::stage_failure(
            ErrorCode::DeployCancelled,
            &stage,
            "Run",
            environment.into(),
            "cancelled by user".to_string(),
            backup_ref,
        )
    }

    fn stage_failure(
        code: ErrorCode,
        stage: &str,
        label: &str,
        environment: String,
        cause: String,
        backup_ref: Option<String>,
    ) -> Self {
        let hint = backup_ref
            .as_deref()
            .map(|id| recovery_hint(&environment, id));
        let details = to_details(StageFailureDetails {
            stage: stage.to_string(),
            environment: environment.clone(),
            cause: cause.clone(),
            backup_ref,
        });

        let err = Self::new(
            code,
            format!("{} to '{}' failed during {}: {}", label, environment, stage, cause),
            details,
        );
        match hint {
            Some(hint) => err.with_hint(hint),
            None => err,
        }
    }

    pub fn deployment_in_progress(environment: impl Into<String>) -> Self {
        let environment = environment.into();
        let mut err = Self::new(
            ErrorCode::DeployInProgress,
            format!("A deployment to '{}' is already in progress", environment),
            serde_json::json!({ "stage": "backing_up", "environment": environment }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn confirmation_rejected(environment: impl Into<String>) -> Self {
        let environment = environment.into();
        Self::new(
            ErrorCode::DeployConfirmationRejected,
            format!("Deployment to '{}' was not confirmed", environment),
            serde_json::json!({ "stage": "awaiting_confirmation", "environment": environment }),
        )
        .with_hint("Pass --confirm yes to deploy to a protected environment")
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        Self::new(
            ErrorCode::RemoteCommandFailed,
            format!("Remote command failed: {}", details.command),
            to_details(details),
        )
    }

    pub fn remote_command_timeout(command: impl Into<String>, timeout_secs: u64) -> Self {
        let command = command.into();
        let mut err = Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!("Command timed out after {}s: {}", timeout_secs, command),
            serde_json::json!({ "command": command, "timeoutSecs": timeout_secs }),
        );
        err.retryable = Some(true);
        err
    }

    pub fn health_check_failed(environment: impl Into<String>, failed: Vec<String>) -> Self {
        let environment = environment.into();
        Self::new(
            ErrorCode::HealthCheckFailed,
            format!(
                "Health verification failed for '{}': {}",
                environment,
                failed.join(", ")
            ),
            serde_json::json!({ "stage": "verifying", "environment": environment, "failed": failed }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(ctx) => format!("IO error ({}): {}", ctx, error),
            None => format!("IO error: {}", error),
        };
        let details = to_details(InternalIoErrorDetails { error, context });

        Self::new(ErrorCode::InternalIoError, message, details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalJsonErrorDetails {
            error: error.into(),
            context,
        });

        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    /// Attach the stage a failure happened in, unless one is already recorded.
    pub fn with_stage(mut self, stage: &str) -> Self {
        if let Value::Object(map) = &mut self.details {
            map.entry("stage")
                .or_insert_with(|| Value::String(stage.to_string()));
        }
        self
    }

    /// Attach the backup reference needed for manual recovery.
    pub fn with_backup_ref(mut self, environment: &str, backup_ref: &str) -> Self {
        if self.backup_ref().is_some() {
            return self;
        }
        if let Value::Object(map) = &mut self.details {
            map.insert(
                "backupRef".to_string(),
                Value::String(backup_ref.to_string()),
            );
        }
        self.with_hint(recovery_hint(environment, backup_ref))
    }

    pub fn stage(&self) -> Option<&str> {
        self.details.get("stage").and_then(Value::as_str)
    }

    pub fn backup_ref(&self) -> Option<&str> {
        self.details.get("backupRef").and_then(Value::as_str)
    }
}
