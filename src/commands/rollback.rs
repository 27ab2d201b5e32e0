use clap::Args;
use serde::Serialize;

use stagehand::history::DeploymentRecord;

use super::CmdResult;

#[derive(Args)]
pub struct RollbackArgs {
    /// Environment name
    pub environment: String,

    /// Backup id to restore (defaults to the most recent)
    #[arg(long, value_name = "ID")]
    pub backup: Option<String>,

    /// Confirmation token for protected environments
    #[arg(long, value_name = "TOKEN")]
    pub confirm: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutput {
    pub command: String,
    pub environment: String,
    pub deployment: DeploymentRecord,
}

pub fn run(args: RollbackArgs, global: &crate::commands::GlobalArgs) -> CmdResult<RollbackOutput> {
    let ws = global.workspace()?;
    let controller = ws.controller(global.cancel.clone())?;

    let env = controller.registry().resolve(&args.environment)?;
    let token = super::confirmation_token(args.confirm, &env.name, env.requires_confirmation)?;

    let deployment = controller.rollback(&env.name, args.backup.as_deref(), token.as_deref())?;

    Ok((
        RollbackOutput {
            command: "rollback".to_string(),
            environment: env.name,
            deployment,
        },
        0,
    ))
}
