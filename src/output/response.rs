//! CLI response formatting and output.
//!
//! Provides JSON envelope, printing, the summary line and exit code mapping.

use serde::Serialize;
use serde_json::Value;
use stagehand::error::Hint;
use stagehand::{Error, ErrorCode, Result};

#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<Hint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl CliError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: if err.hints.is_empty() {
                None
            } else {
                Some(err.hints.clone())
            },
            retryable: err.retryable,
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize response".to_string()))
        })
    }
}

impl CliResponse<()> {
    pub fn from_error(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CliError::from_error(err)),
        }
    }
}

fn print_response<T: Serialize>(response: &CliResponse<T>) -> Result<()> {
    use std::io::{self, Write};

    let payload = response.to_json()?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", payload) {
        if e.kind() == io::ErrorKind::BrokenPipe {
            return Ok(()); // Exit gracefully on SIGPIPE
        }
        return Err(Error::internal_io(
            e.to_string(),
            Some("write stdout".to_string()),
        ));
    }
    Ok(())
}

pub fn map_cmd_result_to_json<T: Serialize>(
    result: Result<(T, i32)>,
) -> (Result<serde_json::Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => (
                Err(Error::internal_json(
                    err.to_string(),
                    Some("serialize response".to_string()),
                )),
                1,
            ),
        },
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            (Err(err), exit_code)
        }
    }
}

pub fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ConfigMissingKey
        | ErrorCode::ConfigInvalidJson
        | ErrorCode::ConfigInvalidValue
        | ErrorCode::ValidationInvalidArgument => 2,

        ErrorCode::EnvironmentUnknown => 4,

        ErrorCode::RemoteCommandFailed
        | ErrorCode::RemoteCommandTimeout
        | ErrorCode::DeployTransferFailed
        | ErrorCode::DeployApplyFailed
        | ErrorCode::DeployInProgress
        | ErrorCode::DeployConfirmationRejected
        | ErrorCode::DeployCancelled
        | ErrorCode::DeployPostDeployFailed => 20,

        ErrorCode::BuildStepFailed
        | ErrorCode::BuildArtifactExists
        | ErrorCode::BuildArtifactNotFound
        | ErrorCode::BuildIntegrityMismatch => 30,

        ErrorCode::BackupSnapshotFailed
        | ErrorCode::BackupRestoreFailed
        | ErrorCode::BackupNotFound => 40,

        ErrorCode::HealthCheckFailed => 50,

        ErrorCode::InternalIoError
        | ErrorCode::InternalJsonError
        | ErrorCode::InternalUnexpected => 1,
    }
}

pub fn print_json_result(result: &Result<serde_json::Value>) -> Result<()> {
    match result {
        Ok(data) => print_response(&CliResponse::success(data)),
        Err(err) => print_response(&CliResponse::<()>::from_error(err)),
    }
}

/// Error and warning counts for the summary line. A failed command counts
/// as one error; otherwise the `errors` and `warnings` arrays are counted.
fn counts(result: &Result<Value>) -> (usize, usize) {
    let array_len = |value: &Value, key: &str| {
        value.get(key).and_then(Value::as_array).map_or(0, Vec::len)
    };
    match result {
        Ok(value) => (array_len(value, "errors"), array_len(value, "warnings")),
        Err(_) => (1, 0),
    }
}

pub fn summary_line(command: &str, result: &Result<Value>) -> String {
    let (errors, warnings) = counts(result);
    format!("{}: {} error(s), {} warning(s)", command, errors, warnings)
}

/// Always written to stderr, terminal or not.
pub fn print_summary(command: &str, result: &Result<Value>) {
    eprintln!("{}", summary_line(command, result));
}
