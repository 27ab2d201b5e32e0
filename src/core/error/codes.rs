use serde::Serialize;

use super::ErrorCode;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHelpSummary {
    pub code: String,
    pub summary: String,
}

pub fn all_codes() -> &'static [ErrorCode] {
    &[
        ErrorCode::ConfigMissingKey,
        ErrorCode::ConfigInvalidJson,
        ErrorCode::ConfigInvalidValue,
        ErrorCode::EnvironmentUnknown,
        ErrorCode::ValidationInvalidArgument,
        ErrorCode::BuildStepFailed,
        ErrorCode::BuildArtifactExists,
        ErrorCode::BuildArtifactNotFound,
        ErrorCode::BuildIntegrityMismatch,
        ErrorCode::BackupSnapshotFailed,
        ErrorCode::BackupRestoreFailed,
        ErrorCode::BackupNotFound,
        ErrorCode::DeployTransferFailed,
        ErrorCode::DeployApplyFailed,
        ErrorCode::DeployInProgress,
        ErrorCode::DeployConfirmationRejected,
        ErrorCode::DeployCancelled,
        ErrorCode::DeployPostDeployFailed,
        ErrorCode::RemoteCommandFailed,
        ErrorCode::RemoteCommandTimeout,
        ErrorCode::HealthCheckFailed,
        ErrorCode::InternalIoError,
        ErrorCode::InternalJsonError,
        ErrorCode::InternalUnexpected,
    ]
}

pub fn parse_code(code: &str) -> Option<ErrorCode> {
    all_codes()
        .iter()
        .copied()
        .find(|candidate| candidate.as_str() == code)
}

pub fn summary(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ConfigMissingKey => "A required configuration key is not set",
        ErrorCode::ConfigInvalidJson => "stagehand.json is not valid JSON",
        ErrorCode::ConfigInvalidValue => "A configuration value is out of range or malformed",
        ErrorCode::EnvironmentUnknown => "The environment name is not configured",
        ErrorCode::ValidationInvalidArgument => "Invalid CLI argument",
        ErrorCode::BuildStepFailed => "A required build step exited non-zero or timed out",
        ErrorCode::BuildArtifactExists => "An artifact with the same name was already built",
        ErrorCode::BuildArtifactNotFound => "No artifact matches the requested path",
        ErrorCode::BuildIntegrityMismatch => "Artifact checksum differs from its manifest",
        ErrorCode::BackupSnapshotFailed => "Pre-deploy backup could not be captured",
        ErrorCode::BackupRestoreFailed => "Restoring a backup failed; manual recovery needed",
        ErrorCode::BackupNotFound => "No matching backup exists for the environment",
        ErrorCode::DeployTransferFailed => "Artifact could not be transferred to the target",
        ErrorCode::DeployApplyFailed => "Artifact could not be applied on the target",
        ErrorCode::DeployInProgress => "Another deployment holds the environment lock",
        ErrorCode::DeployConfirmationRejected => "Protected environment was not confirmed",
        ErrorCode::DeployCancelled => "Run was cancelled before completion",
        ErrorCode::DeployPostDeployFailed => "A post-deploy task failed under the rollback policy",
        ErrorCode::RemoteCommandFailed => "Remote command returned non-zero",
        ErrorCode::RemoteCommandTimeout => "Remote command timed out",
        ErrorCode::HealthCheckFailed => "At least one health check failed",
        ErrorCode::InternalIoError => "Internal IO error",
        ErrorCode::InternalJsonError => "Internal JSON error",
        ErrorCode::InternalUnexpected => "Unexpected internal error",
    }
}

pub fn list() -> Vec<ErrorHelpSummary> {
    all_codes()
        .iter()
        .copied()
        .map(|code| ErrorHelpSummary {
            code: code.as_str().to_string(),
            summary: summary(code).to_string(),
        })
        .collect()
}
