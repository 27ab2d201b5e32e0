use clap::Args;
use serde::Serialize;

use stagehand::history::{DeploymentHistory, DeploymentRecord};

use super::CmdResult;

#[derive(Args)]
pub struct HistoryArgs {
    /// Environment name
    pub environment: String,

    /// Show at most this many records
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOutput {
    pub command: String,
    pub environment: String,
    pub deployments: Vec<DeploymentRecord>,
}

pub fn run(args: HistoryArgs, global: &crate::commands::GlobalArgs) -> CmdResult<HistoryOutput> {
    let ws = global.workspace()?;
    let env = ws.registry()?.resolve(&args.environment)?;

    let mut deployments = DeploymentHistory::new(ws.layout.clone()).list(&env.name)?;
    if let Some(limit) = args.limit {
        deployments.truncate(limit);
    }

    Ok((
        HistoryOutput {
            command: "history".to_string(),
            environment: env.name,
            deployments,
        },
        0,
    ))
}
