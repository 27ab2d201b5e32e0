use stagehand::pipeline::CancelFlag;
use stagehand::workspace::Workspace;

pub type CmdResult<T> = stagehand::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    /// Explicit stagehand.json path (`--config`).
    pub config: Option<String>,
    /// Set by the Ctrl-C handler.
    pub cancel: CancelFlag,
}

impl GlobalArgs {
    pub fn workspace(&self) -> stagehand::Result<Workspace> {
        Workspace::load(self.config.as_deref())
    }
}

/// Ask for the confirmation token on a terminal when the caller did not pass
/// one. Non-interactive callers get `None` and the controller rejects the run.
pub(crate) fn confirmation_token(
    provided: Option<String>,
    environment: &str,
    required: bool,
) -> stagehand::Result<Option<String>> {
    if provided.is_some() || !required || !crate::tty::require_tty_for_interactive() {
        return Ok(provided);
    }
    let answer = crate::tty::prompt(&format!(
        "'{}' is protected. Type '{}' to continue: ",
        environment,
        stagehand::pipeline::CONFIRMATION_TOKEN
    ))?;
    Ok(Some(answer))
}

pub mod backups;
pub mod build;
pub mod deploy;
pub mod env;
pub mod error;
pub mod health_check;
pub mod history;
pub mod rollback;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args))
    };
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (stagehand::Result<serde_json::Value>, i32) {
    match command {
        // Commands without global context
        crate::Commands::Error(args) => dispatch!(args, error),

        // Commands with global context
        crate::Commands::Build(args) => dispatch!(args, global, build),
        crate::Commands::Deploy(args) => dispatch!(args, global, deploy),
        crate::Commands::Rollback(args) => dispatch!(args, global, rollback),
        crate::Commands::HealthCheck(args) => dispatch!(args, global, health_check),
        crate::Commands::Backups(args) => dispatch!(args, global, backups),
        crate::Commands::History(args) => dispatch!(args, global, history),
        crate::Commands::Env(args) => dispatch!(args, global, env),
    }
}
