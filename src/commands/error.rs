use clap::{Args, Subcommand};
use serde::Serialize;

use stagehand::error::codes::{self, ErrorHelpSummary};

use super::CmdResult;

#[derive(Args)]
pub struct ErrorArgs {
    #[command(subcommand)]
    command: ErrorCommand,
}

#[derive(Subcommand)]
enum ErrorCommand {
    /// List every error code with a one-line summary
    Codes,
    /// Explain one error code
    Explain {
        /// Dotted code, e.g. deploy.apply_failed
        code: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorOutput {
    pub command: String,
    pub codes: Vec<ErrorHelpSummary>,
}

pub fn run(args: ErrorArgs) -> CmdResult<ErrorOutput> {
    match args.command {
        ErrorCommand::Codes => Ok((
            ErrorOutput {
                command: "error.codes".to_string(),
                codes: codes::list(),
            },
            0,
        )),
        ErrorCommand::Explain { code } => {
            let parsed = codes::parse_code(&code).ok_or_else(|| {
                stagehand::Error::validation_invalid_argument(
                    "code",
                    format!("Unknown error code '{}'", code),
                    None,
                    None,
                )
                .with_hint("Run 'stagehand error codes' to list all codes")
            })?;
            Ok((
                ErrorOutput {
                    command: "error.explain".to_string(),
                    codes: vec![ErrorHelpSummary {
                        code: parsed.as_str().to_string(),
                        summary: codes::summary(parsed).to_string(),
                    }],
                },
                0,
            ))
        }
    }
}
