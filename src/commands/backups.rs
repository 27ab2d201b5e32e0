use clap::Args;
use serde::Serialize;

use stagehand::backup::{BackupManager, BackupRecord};

use super::CmdResult;

#[derive(Args)]
pub struct BackupsArgs {
    /// Environment name
    pub environment: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupsOutput {
    pub command: String,
    pub environment: String,
    pub backups: Vec<BackupRecord>,
}

pub fn run(args: BackupsArgs, global: &crate::commands::GlobalArgs) -> CmdResult<BackupsOutput> {
    let ws = global.workspace()?;
    let env = ws.registry()?.resolve(&args.environment)?;
    let backups = BackupManager::new(ws.layout.clone()).list(&env.name)?;

    Ok((
        BackupsOutput {
            command: "backups".to_string(),
            environment: env.name,
            backups,
        },
        0,
    ))
}
