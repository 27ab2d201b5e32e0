use clap::{Args, Subcommand};
use serde::Serialize;

use stagehand::environment::EnvironmentConfig;

use super::CmdResult;

#[derive(Args)]
pub struct EnvArgs {
    #[command(subcommand)]
    command: EnvCommand,
}

#[derive(Subcommand)]
enum EnvCommand {
    /// List recognized environments and whether each resolves
    List,
    /// Show the resolved configuration of one environment
    Show {
        /// Environment name
        name: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntry {
    pub name: String,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvOutput {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<EnvEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub fn run(args: EnvArgs, global: &crate::commands::GlobalArgs) -> CmdResult<EnvOutput> {
    let ws = global.workspace()?;
    let registry = ws.registry()?;

    match args.command {
        EnvCommand::List => {
            let entries: Vec<EnvEntry> = registry
                .all()
                .map(|(name, resolved)| match resolved {
                    Ok(env) => EnvEntry {
                        name: name.to_string(),
                        resolved: true,
                        target: Some(env.target_label()),
                        requires_confirmation: env.requires_confirmation,
                        problem: None,
                    },
                    Err(e) => EnvEntry {
                        name: name.to_string(),
                        resolved: false,
                        target: None,
                        requires_confirmation: false,
                        problem: Some(e.message.clone()),
                    },
                })
                .collect();
            let warnings = entries
                .iter()
                .filter_map(|e| e.problem.as_ref().map(|p| format!("{}: {}", e.name, p)))
                .collect();

            Ok((
                EnvOutput {
                    command: "env.list".to_string(),
                    environments: Some(entries),
                    environment: None,
                    warnings,
                },
                0,
            ))
        }
        EnvCommand::Show { name } => Ok((
            EnvOutput {
                command: "env.show".to_string(),
                environments: None,
                environment: Some(registry.resolve(&name)?),
                warnings: Vec::new(),
            },
            0,
        )),
    }
}
