use clap::Args;
use serde::Serialize;
use std::path::Path;

use stagehand::build::{self, BuildArtifact};
use stagehand::pipeline::{PipelineRunReport, RunOptions, RunPlan};
use stagehand::utils::artifact;

use super::CmdResult;
use crate::output::{self, CliError};

#[derive(Args)]
pub struct DeployArgs {
    /// Environment name (staging, production, or configured)
    pub environment: String,

    /// Artifact archive or manifest path (glob allowed); defaults to the newest build
    #[arg(long)]
    pub artifact: Option<String>,

    /// Build a fresh artifact first
    #[arg(long, conflicts_with = "artifact")]
    pub build: bool,

    /// Confirmation token for protected environments
    #[arg(long, value_name = "TOKEN")]
    pub confirm: Option<String>,

    /// Resolve and confirm, then report the plan without touching the target
    #[arg(long)]
    pub dry_run: bool,

    /// Skip post-deploy health verification
    #[arg(long)]
    pub no_verify: bool,

    /// Report transfer/apply failures instead of restoring the backup
    #[arg(long)]
    pub no_rollback: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutput {
    pub command: String,
    pub environment: String,
    pub artifact: BuildArtifact,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RunPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PipelineRunReport>,
    pub deployed_unhealthy: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CliError>,
}

pub fn run(args: DeployArgs, global: &crate::commands::GlobalArgs) -> CmdResult<DeployOutput> {
    let ws = global.workspace()?;
    let controller = ws.controller(global.cancel.clone())?;

    // Prompt before building so a declined run costs nothing.
    let required = controller
        .registry()
        .resolve(&args.environment)
        .map(|env| env.requires_confirmation)
        .unwrap_or(false);
    let token = super::confirmation_token(args.confirm.clone(), &args.environment, required)?;

    let mut warnings = Vec::new();
    let artifact = if args.build {
        let outcome = super::build::build_artifact(&ws, false)?;
        warnings.extend(super::build::manifest_warnings(&outcome.manifest));
        outcome.artifact
    } else {
        select_artifact(args.artifact.as_deref(), &ws.artifact_dir())?
    };

    let mut options = RunOptions::from_config(&ws.config).confirmed_with(token);
    options.verify = !args.no_verify;
    if args.no_rollback {
        options.auto_rollback = false;
    }

    if args.dry_run {
        let plan = controller.plan(&args.environment, &artifact, &options)?;
        return Ok((
            DeployOutput {
                command: "deploy".to_string(),
                environment: plan.environment.name.clone(),
                artifact,
                dry_run: true,
                plan: Some(plan),
                run: None,
                deployed_unhealthy: false,
                warnings,
                errors: Vec::new(),
            },
            0,
        ));
    }

    let mut report = controller.run(&args.environment, &artifact, &options);
    warnings.extend(report.warnings.iter().cloned());

    let (mut errors, exit_code) = match report.error.take() {
        Some(err) => {
            let code = output::exit_code_for_error(err.code);
            (vec![CliError::from_error(&err)], code)
        }
        None => (Vec::new(), 0),
    };

    // Unhealthy but deployed still exits 0; the verdict is reported as an error entry.
    if report.deployed_unhealthy() {
        let failed = report
            .health
            .as_ref()
            .map(|health| health.failed_checks())
            .unwrap_or_default();
        let err = stagehand::Error::health_check_failed(&report.environment, failed);
        errors.push(CliError::from_error(&err));
    }

    Ok((
        DeployOutput {
            command: "deploy".to_string(),
            environment: report.environment.clone(),
            artifact,
            dry_run: false,
            plan: None,
            deployed_unhealthy: report.deployed_unhealthy(),
            run: Some(report),
            warnings,
            errors,
        },
        exit_code,
    ))
}

fn select_artifact(pattern: Option<&str>, artifact_dir: &Path) -> stagehand::Result<BuildArtifact> {
    let (artifact, _manifest) = match pattern {
        Some(pattern) => build::load_artifact(&artifact::resolve_artifact_path(pattern)?)?,
        None => build::latest_artifact(artifact_dir).map_err(|e| {
            e.with_hint("Run 'stagehand build' first, or pass --build or --artifact")
        })?,
    };
    Ok(artifact)
}
