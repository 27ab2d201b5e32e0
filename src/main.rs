use clap::{Parser, Subcommand};

mod commands;
mod output;
mod tty;

use commands::{backups, build, deploy, env, error, health_check, history, rollback, GlobalArgs};
use stagehand::pipeline::CancelFlag;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version = VERSION)]
#[command(about = "Build, back up, deploy and verify a site, one environment at a time")]
struct Cli {
    /// Path to stagehand.json (default: $STAGEHAND_CONFIG, then ./stagehand.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a versioned artifact and its manifest
    Build(build::BuildArgs),
    /// Back up, deploy and verify an environment
    Deploy(deploy::DeployArgs),
    /// Restore an environment from a backup
    Rollback(rollback::RollbackArgs),
    /// Run health checks against an environment
    HealthCheck(health_check::HealthCheckArgs),
    /// List backups of an environment, newest first
    Backups(backups::BackupsArgs),
    /// List recorded deployments of an environment
    History(history::HistoryArgs),
    /// Inspect environment configuration
    Env(env::EnvArgs),
    /// Describe error codes
    Error(error::ErrorArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Build(_) => "build",
            Commands::Deploy(_) => "deploy",
            Commands::Rollback(_) => "rollback",
            Commands::HealthCheck(_) => "health-check",
            Commands::Backups(_) => "backups",
            Commands::History(_) => "history",
            Commands::Env(_) => "env",
            Commands::Error(_) => "error",
        }
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.cancel();
        eprintln!("[pipeline] cancellation requested; stopping after the current stage");
    }) {
        eprintln!("[pipeline] Ctrl-C handler not installed: {}", e);
    }

    let global = GlobalArgs {
        config: cli.config,
        cancel,
    };

    let name = cli.command.name();
    tty::status("stagehand is working...");
    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if let Err(e) = output::print_json_result(&json_result) {
        eprintln!("{}", e.message);
    }
    output::print_summary(name, &json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
