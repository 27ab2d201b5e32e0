use clap::Args;
use serde::Serialize;

use stagehand::health::{CheckName, HealthReport, OverallStatus};

use super::CmdResult;
use crate::output;

#[derive(Args)]
pub struct HealthCheckArgs {
    /// Environment name
    pub environment: String,

    /// Run only these checks (repeatable): connectivity, runtime, extensions,
    /// writable_state, dependencies, backing_store
    #[arg(long = "check", value_name = "NAME")]
    pub checks: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckOutput {
    pub command: String,
    pub report: HealthReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub fn run(args: HealthCheckArgs, global: &crate::commands::GlobalArgs) -> CmdResult<HealthCheckOutput> {
    let ws = global.workspace()?;
    let checks = if args.checks.is_empty() {
        ws.config.health.checks.clone()
    } else {
        parse_checks(&args.checks)?
    };

    let controller = ws.controller(global.cancel.clone())?;
    let report = controller.health_check(&args.environment, &checks)?;

    let exit_code = match report.overall {
        OverallStatus::Fail => output::exit_code_for_error(stagehand::ErrorCode::HealthCheckFailed),
        _ => 0,
    };

    Ok((
        HealthCheckOutput {
            command: "health-check".to_string(),
            warnings: report.warned_checks(),
            errors: report.failed_checks(),
            report,
        },
        exit_code,
    ))
}

fn parse_checks(values: &[String]) -> stagehand::Result<Vec<CheckName>> {
    values
        .iter()
        .map(|value| {
            CheckName::parse(value).ok_or_else(|| {
                stagehand::Error::validation_invalid_argument(
                    "check",
                    format!("Unknown check '{}'", value),
                    None,
                    Some(
                        CheckName::all()
                            .iter()
                            .map(|name| name.as_str().to_string())
                            .collect(),
                    ),
                )
            })
        })
        .collect()
}
