//! Deployment backends: the only code that touches a target's files.
//!
//! [`LocalBackend`] works on a directory of this machine; [`SshBackend`]
//! drives a remote host with `ssh`, `scp`, `zip` and `unzip`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::environment::EnvironmentConfig;
use crate::error::{Error, RemoteCommandFailedDetails, Result, TargetDetails};
use crate::paths::{self, StateLayout};
use crate::ssh::SshClient;
use crate::utils::archive::{self, ExcludeSet};
use crate::utils::command::{execute_local_command_in_dir, CommandOutput};
use crate::utils::shell;

/// Operations the backup manager, executor and health checks need from a
/// target. Paths are relative to the environment root; `.` means the whole
/// root.
pub trait DeployBackend: Send + Sync {
    fn describe(&self) -> String;

    /// The subset of `paths` that currently exist on the target. A dangling
    /// symlink counts as present.
    fn existing_paths(&self, paths: &[String]) -> Result<Vec<String>>;

    /// Archive `paths` from the target into the local zip `dest`.
    fn capture(&self, paths: &[String], dest: &Path) -> Result<()>;

    fn remove_paths(&self, paths: &[String]) -> Result<()>;

    /// Stage a local archive on the target and return where it landed.
    fn transfer(&self, archive: &Path) -> Result<String>;

    /// Unpack a staged archive into the environment root and drop it.
    ///
    /// Entries overwrite what is already there; files absent from the archive
    /// are left in place. Callers that need an exact tree clear the paths
    /// first, as restore does with [`DeployBackend::remove_paths`].
    fn apply(&self, staged: &str) -> Result<()>;

    /// Run a shell command in the environment root.
    fn run(&self, command: &str, timeout: Duration) -> CommandOutput;
}

/// Chooses a backend for a resolved environment.
pub trait BackendFactory: Send + Sync {
    fn backend_for(&self, env: &EnvironmentConfig) -> Result<Arc<dyn DeployBackend>>;
}

/// Local hosts get [`LocalBackend`], everything else [`SshBackend`].
pub struct TransportFactory {
    layout: StateLayout,
    command_timeout: Duration,
}

impl TransportFactory {
    pub fn new(layout: StateLayout, command_timeout: Duration) -> Self {
        Self {
            layout,
            command_timeout,
        }
    }
}

impl BackendFactory for TransportFactory {
    fn backend_for(&self, env: &EnvironmentConfig) -> Result<Arc<dyn DeployBackend>> {
        if env.is_local() {
            return Ok(Arc::new(LocalBackend::new(
                &env.path,
                self.layout.incoming(&env.name),
            )));
        }
        log_status!("ssh", "Using {} for '{}'", env.target_label(), env.name);
        Ok(Arc::new(SshBackend::new(
            SshClient::from_environment(env)?,
            &env.path,
            self.command_timeout,
        )))
    }
}

fn normalize_all(paths: &[String]) -> Result<Vec<String>> {
    let mut normalized = Vec::with_capacity(paths.len());
    for path in paths {
        let relative = archive::normalize_relative(path)?;
        if !normalized.contains(&relative) {
            normalized.push(relative);
        }
    }
    Ok(normalized)
}

fn display_relative(relative: &str) -> String {
    if relative.is_empty() {
        ".".to_string()
    } else {
        relative.to_string()
    }
}

// === Local ===

pub struct LocalBackend {
    root: PathBuf,
    staging: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging: staging.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn root_has_entries(&self) -> bool {
        fs::read_dir(&self.root)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }
}

impl DeployBackend for LocalBackend {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn existing_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        Ok(normalize_all(paths)?
            .into_iter()
            .filter(|relative| {
                if relative.is_empty() {
                    self.root_has_entries()
                } else {
                    fs::symlink_metadata(self.root.join(relative)).is_ok()
                }
            })
            .map(|relative| display_relative(&relative))
            .collect())
    }

    fn capture(&self, paths: &[String], dest: &Path) -> Result<()> {
        let entries = normalize_all(paths)?;
        archive::pack_tree(&self.root, &entries, &ExcludeSet::default(), dest)?;
        Ok(())
    }

    fn remove_paths(&self, paths: &[String]) -> Result<()> {
        for relative in normalize_all(paths)? {
            if relative.is_empty() {
                if !self.root.exists() {
                    continue;
                }
                let entries = fs::read_dir(&self.root).map_err(|e| {
                    Error::internal_io(e.to_string(), Some(format!("read {}", self.root.display())))
                })?;
                for entry in entries.filter_map(|e| e.ok()) {
                    remove_any(&entry.path())?;
                }
            } else {
                remove_any(&self.root.join(&relative))?;
            }
        }
        Ok(())
    }

    fn transfer(&self, archive_path: &Path) -> Result<String> {
        paths::ensure_dir(&self.staging)?;
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact.zip".to_string());
        let staged = self.staging.join(name);
        fs::copy(archive_path, &staged).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("copy to {}", staged.display())))
        })?;
        Ok(staged.to_string_lossy().to_string())
    }

    fn apply(&self, staged: &str) -> Result<()> {
        let staged = Path::new(staged);
        paths::ensure_dir(&self.root)?;
        archive::unpack(staged, &self.root)?;
        let _ = fs::remove_file(staged);
        Ok(())
    }

    fn run(&self, command: &str, timeout: Duration) -> CommandOutput {
        execute_local_command_in_dir(command, Some(&self.root), None, Some(timeout))
    }
}

fn remove_any(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| Error::internal_io(e.to_string(), Some(format!("remove {}", path.display()))))
}

// === SSH ===

pub struct SshBackend {
    client: SshClient,
    root: String,
    timeout: Duration,
}

impl SshBackend {
    pub fn new(client: SshClient, root: &str, timeout: Duration) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn in_root(&self, command: &str) -> String {
        shell::in_dir(&self.root, command)
    }

    fn check(&self, command: &str, output: CommandOutput) -> Result<CommandOutput> {
        if output.success {
            return Ok(output);
        }
        if output.timed_out {
            return Err(Error::remote_command_timeout(command, self.timeout.as_secs()));
        }
        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            target: TargetDetails {
                environment: None,
                host: Some(self.client.host.clone()),
            },
        }))
    }

    fn exec(&self, command: &str) -> Result<CommandOutput> {
        let output = self.client.execute(command, Some(self.timeout));
        self.check(command, output)
    }

    fn quoted(paths: &[String]) -> String {
        paths
            .iter()
            .map(|p| shell::quote_path(&display_relative(p)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl DeployBackend for SshBackend {
    fn describe(&self) -> String {
        format!("{}:{}", self.client.destination(), self.root)
    }

    fn existing_paths(&self, paths: &[String]) -> Result<Vec<String>> {
        let entries = normalize_all(paths)?;
        let command = format!(
            "if cd {} 2>/dev/null; then for p in {}; do \
             if [ \"$p\" = . ]; then [ -n \"$(ls -A)\" ] && echo .; \
             elif [ -e \"$p\" ] || [ -L \"$p\" ]; then echo \"$p\"; fi; done; fi; true",
            shell::quote_path(&self.root),
            Self::quoted(&entries)
        );
        let output = self.exec(&command)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn capture(&self, paths: &[String], dest: &Path) -> Result<()> {
        let entries = normalize_all(paths)?;
        let remote_tmp = format!("/tmp/stagehand-backup-{}.zip", uuid::Uuid::new_v4());
        let zip_cmd = self.in_root(&format!(
            "zip -qry {} {}",
            shell::quote_path(&remote_tmp),
            Self::quoted(&entries)
        ));
        self.exec(&zip_cmd)?;

        let download = self.client.download_file(&remote_tmp, dest, Some(self.timeout));
        let cleanup = format!("rm -f {}", shell::quote_path(&remote_tmp));
        let _ = self.client.execute(&cleanup, Some(self.timeout));
        self.check(&format!("scp {}", remote_tmp), download)?;
        Ok(())
    }

    fn remove_paths(&self, paths: &[String]) -> Result<()> {
        let entries = normalize_all(paths)?;
        let mut commands = Vec::new();
        for relative in &entries {
            if relative.is_empty() {
                commands.push("find . -mindepth 1 -maxdepth 1 -exec rm -rf {} +".to_string());
            } else {
                commands.push(format!("rm -rf -- {}", shell::quote_path(relative)));
            }
        }
        if commands.is_empty() {
            return Ok(());
        }
        let command = format!(
            "mkdir -p {} && {}",
            shell::quote_path(&self.root),
            self.in_root(&commands.join(" && "))
        );
        self.exec(&command)?;
        Ok(())
    }

    fn transfer(&self, archive_path: &Path) -> Result<String> {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact.zip".to_string());
        let staged = format!("{}/.stagehand-{}", self.root, name);

        self.exec(&format!("mkdir -p {}", shell::quote_path(&self.root)))?;
        log_status!("ssh", "Uploading {} to {}", name, self.describe());
        let upload = self
            .client
            .upload_file(archive_path, &staged, Some(self.timeout));
        self.check(&format!("scp {}", name), upload)?;
        Ok(staged)
    }

    fn apply(&self, staged: &str) -> Result<()> {
        let quoted = shell::quote_path(staged);
        let command = self.in_root(&format!("unzip -oq {} && rm -f {}", quoted, quoted));
        self.exec(&command)?;
        Ok(())
    }

    fn run(&self, command: &str, timeout: Duration) -> CommandOutput {
        self.client.execute(&self.in_root(command), Some(timeout))
    }
}
