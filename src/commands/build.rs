use clap::Args;
use serde::Serialize;

use stagehand::build::{ArtifactBuilder, BuildArtifact, BuildManifest, BuildOutcome, ShellStepRunner};
use stagehand::workspace::Workspace;

use super::CmdResult;

#[derive(Args)]
pub struct BuildArgs {
    /// Replace an artifact with the same name instead of failing
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    pub command: String,
    pub artifact: BuildArtifact,
    pub manifest: BuildManifest,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub fn run(args: BuildArgs, global: &crate::commands::GlobalArgs) -> CmdResult<BuildOutput> {
    let ws = global.workspace()?;
    let outcome = build_artifact(&ws, args.overwrite)?;
    let warnings = manifest_warnings(&outcome.manifest);

    Ok((
        BuildOutput {
            command: "build".to_string(),
            artifact: outcome.artifact,
            manifest: outcome.manifest,
            warnings,
        },
        0,
    ))
}

pub(crate) fn build_artifact(ws: &Workspace, overwrite: bool) -> stagehand::Result<BuildOutcome> {
    ArtifactBuilder::new(ws.build_options(overwrite), ShellStepRunner)
        .build(&ws.build_steps())
        .map_err(|e| match e.code {
            stagehand::ErrorCode::BuildArtifactExists => {
                e.with_hint("Re-run with --overwrite to replace it")
            }
            _ => e,
        })
}

pub(crate) fn manifest_warnings(manifest: &BuildManifest) -> Vec<String> {
    manifest
        .diagnostics
        .iter()
        .map(|d| format!("{}: {}", d.source, d.message))
        .collect()
}
