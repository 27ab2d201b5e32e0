use crate::environment::EnvironmentConfig;
use crate::error::{Error, Result};
use crate::utils::command::{output_with_timeout, CommandOutput};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
}

impl SshClient {
    pub fn from_environment(env: &EnvironmentConfig) -> Result<Self> {
        let identity_file = match &env.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::config_invalid_value(
                        format!("environments.{}.identityFile", env.name),
                        Some(expanded),
                        "identity file does not exist",
                    ));
                }
                Some(expanded)
            }
            _ => None,
        };

        Ok(Self {
            host: env.host.clone(),
            user: env.user.clone(),
            port: env.port,
            identity_file,
        })
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Non-interactive: never prompt, and drop stalled connections.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    fn build_scp_args(&self) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-o".to_string(), "BatchMode=yes".to_string()];

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-P".to_string());
            args.push(self.port.to_string());
        }

        args
    }

    /// Run `command` on the remote host, retrying transient connection errors.
    pub fn execute(&self, command: &str, timeout: Option<Duration>) -> CommandOutput {
        self.with_retry(|| {
            let mut cmd = Command::new("ssh");
            cmd.args(self.build_ssh_args(command));
            output_with_timeout(cmd, timeout)
        })
    }

    /// Copy a local file to `remote_path`.
    pub fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Option<Duration>,
    ) -> CommandOutput {
        self.with_retry(|| {
            let mut cmd = Command::new("scp");
            cmd.args(self.build_scp_args());
            cmd.arg(local_path);
            cmd.arg(format!("{}:{}", self.destination(), remote_path));
            output_with_timeout(cmd, timeout)
        })
    }

    /// Copy `remote_path` to a local file.
    pub fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        timeout: Option<Duration>,
    ) -> CommandOutput {
        self.with_retry(|| {
            let mut cmd = Command::new("scp");
            cmd.args(self.build_scp_args());
            cmd.arg(format!("{}:{}", self.destination(), remote_path));
            cmd.arg(local_path);
            output_with_timeout(cmd, timeout)
        })
    }

    fn with_retry<F>(&self, attempt_once: F) -> CommandOutput
    where
        F: Fn() -> CommandOutput,
    {
        let backoff_secs = [0, 2, 5]; // delays before retry 1, 2, 3
        let mut result = attempt_once();

        for attempt in 1..MAX_ATTEMPTS {
            if result.success || result.timed_out || !is_transient_ssh_error(&result) {
                return result;
            }

            let delay = backoff_secs.get(attempt as usize).copied().unwrap_or(5);
            log_status!(
                "ssh",
                "Connection to {} failed (attempt {}/{}), retrying in {}s...",
                self.host,
                attempt,
                MAX_ATTEMPTS,
                delay
            );
            std::thread::sleep(Duration::from_secs(delay));
            result = attempt_once();
        }

        result
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(
        host.trim().to_ascii_lowercase().as_str(),
        "localhost" | "127.0.0.1" | "::1" | "local"
    )
}

/// Check if an SSH failure is a transient connection error worth retrying.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}
