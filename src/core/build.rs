use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::defaults::BuildStepConfig;
use crate::error::{Error, Result};
use crate::git::{self, SourceInfo};
use crate::utils::archive::{self, ExcludeSet};
use crate::utils::artifact::{self, ARCHIVE_EXTENSION};
use crate::utils::command::execute_local_command_in_dir;
use crate::utils::timestamp;

const OUTPUT_TAIL_LINES: usize = 15;
const UNAVAILABLE: &str = "unavailable";

// === Build Steps ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Required,
    BestEffort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildStep {
    pub name: String,
    pub command: String,
    pub mode: StepMode,
    pub timeout: Duration,
}

impl BuildStep {
    pub fn required(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            mode: StepMode::Required,
            timeout: Duration::from_secs(900),
        }
    }

    pub fn best_effort(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            mode: StepMode::BestEffort,
            ..Self::required(name, command)
        }
    }

    pub fn from_config(config: &BuildStepConfig, default_timeout_secs: u64) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            mode: if config.best_effort {
                StepMode::BestEffort
            } else {
                StepMode::Required
            },
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(default_timeout_secs)),
        }
    }
}

/// What running one step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub diagnostic: String,
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            diagnostic: String::new(),
            timed_out: false,
        }
    }

    pub fn failed(exit_code: i32, diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            diagnostic: diagnostic.into(),
            timed_out: false,
        }
    }
}

/// Executes build steps. The shell runner is the production implementation;
/// tests substitute scripted runners.
pub trait StepRunner {
    fn run(&self, step: &BuildStep, workdir: &Path) -> StepOutcome;
}

/// Runs each step as `sh -c <command>` in the source directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellStepRunner;

impl StepRunner for ShellStepRunner {
    fn run(&self, step: &BuildStep, workdir: &Path) -> StepOutcome {
        let output =
            execute_local_command_in_dir(&step.command, Some(workdir), None, Some(step.timeout));

        if output.success {
            return StepOutcome::ok();
        }

        if output.timed_out {
            return StepOutcome {
                success: false,
                exit_code: None,
                diagnostic: format!("timed out after {}s", step.timeout.as_secs()),
                timed_out: true,
            };
        }

        StepOutcome::failed(
            output.exit_code,
            format_step_error(&step.command, workdir, output.exit_code, &output.tail(OUTPUT_TAIL_LINES)),
        )
    }
}

/// Format a step failure with the tail of its output.
/// Only universal POSIX exit codes get hints.
fn format_step_error(command: &str, workdir: &Path, exit_code: i32, output_tail: &str) -> String {
    let hint = match exit_code {
        127 => "\nHint: Command not found. Check that the build tool is installed and in PATH.",
        126 => "\nHint: Permission denied. Check file permissions on the build script.",
        _ => "",
    };

    let mut msg = format!(
        "exit code {}\n  Command: {}\n  Working directory: {}",
        exit_code,
        command,
        workdir.display()
    );

    if !output_tail.is_empty() {
        msg.push_str("\n\n--- Step output (last 15 lines) ---\n");
        msg.push_str(output_tail);
        msg.push_str("\n--- End of output ---");
    }

    msg.push_str(hint);
    msg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Warned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub name: String,
    pub mode: StepMode,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// === Manifest & Artifact ===

/// A non-fatal problem recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub source: String,
    pub message: String,
}

/// Immutable description of a built artifact, written next to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    pub build_timestamp: DateTime<Utc>,
    pub source_revision: String,
    pub source_branch: String,
    pub artifact_name: String,
    pub toolchain_versions: BTreeMap<String, String>,
    pub sha256: String,
    pub file_count: usize,
    #[serde(default)]
    pub steps: Vec<StepReport>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildManifest {
    pub fn warnings_for(&self, source: &str) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.source == source).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    pub name: String,
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub sha256: String,
}

impl BuildArtifact {
    pub fn contents(&self) -> Result<Vec<String>> {
        archive::list_entries(&self.path)
    }
}

/// Deterministic name: `<prefix>-<YYYYMMDDTHHMMSSZ>-<revision[..12]>.zip`.
pub fn artifact_name(prefix: &str, built_at: DateTime<Utc>, revision: &str) -> String {
    format!(
        "{}-{}-{}.{}",
        sanitize_prefix(prefix),
        timestamp::artifact_stamp(built_at),
        git::short_revision(revision),
        ARCHIVE_EXTENSION
    )
}

fn sanitize_prefix(prefix: &str) -> String {
    let cleaned: String = prefix
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

// === Builder ===

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub source_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub prefix: String,
    pub excludes: ExcludeSet,
    pub toolchain: BTreeMap<String, String>,
    pub probe_timeout: Duration,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub artifact: BuildArtifact,
    pub manifest: BuildManifest,
}

pub struct ArtifactBuilder<R: StepRunner> {
    options: BuildOptions,
    runner: R,
    source: Option<SourceInfo>,
    clock: Option<DateTime<Utc>>,
}

impl<R: StepRunner> ArtifactBuilder<R> {
    pub fn new(options: BuildOptions, runner: R) -> Self {
        Self {
            options,
            runner,
            source: None,
            clock: None,
        }
    }

    /// Use a fixed revision/branch instead of asking git.
    pub fn with_source(mut self, source: SourceInfo) -> Self {
        self.source = Some(source);
        self
    }

    /// Use a fixed build timestamp.
    pub fn at(mut self, built_at: DateTime<Utc>) -> Self {
        self.clock = Some(built_at);
        self
    }

    /// Run `steps` in order and publish one artifact plus manifest.
    ///
    /// A failing required step aborts the build before anything is written to
    /// the artifact directory. Packing goes to a hidden partial file that is
    /// renamed into place only once complete.
    pub fn build(&self, steps: &[BuildStep]) -> Result<BuildOutcome> {
        let built_at = self.clock.unwrap_or_else(timestamp::now);
        let source = self
            .source
            .clone()
            .unwrap_or_else(|| git::source_info(&self.options.source_dir));

        let name = artifact_name(&self.options.prefix, built_at, &source.revision);
        let final_path = self.options.artifact_dir.join(&name);
        let manifest_path = artifact::manifest_path_for(&final_path);

        if (final_path.exists() || manifest_path.exists()) && !self.options.overwrite {
            return Err(Error::artifact_exists(&name));
        }

        log_status!(
            "build",
            "Building {} from {} ({})",
            name,
            self.options.source_dir.display(),
            source.branch
        );

        let mut diagnostics = Vec::new();
        let step_reports = self.run_steps(steps, &mut diagnostics)?;

        if git::has_uncommitted_changes(&self.options.source_dir) {
            diagnostics.push(Diagnostic {
                source: "source".to_string(),
                message: "working tree has uncommitted changes".to_string(),
            });
        }

        let toolchain_versions = self.probe_toolchain(&mut diagnostics);

        crate::paths::ensure_dir(&self.options.artifact_dir)?;
        let partial_archive = self.options.artifact_dir.join(format!(".{}.partial", name));
        let partial_manifest = self
            .options
            .artifact_dir
            .join(format!(".{}{}.partial", name, artifact::MANIFEST_SUFFIX));

        let published = self.publish(
            &name,
            built_at,
            &source,
            toolchain_versions,
            step_reports,
            diagnostics,
            &partial_archive,
            &partial_manifest,
            &final_path,
            &manifest_path,
        );

        if published.is_err() {
            let _ = fs::remove_file(&partial_archive);
            let _ = fs::remove_file(&partial_manifest);
        }

        let manifest = published?;
        log_status!(
            "build",
            "Published {} ({} files, {} warning(s))",
            name,
            manifest.file_count,
            manifest.diagnostics.len()
        );

        Ok(BuildOutcome {
            artifact: BuildArtifact {
                name,
                path: final_path,
                manifest_path,
                sha256: manifest.sha256.clone(),
            },
            manifest,
        })
    }

    fn run_steps(
        &self,
        steps: &[BuildStep],
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(steps.len());

        for step in steps {
            log_status!("build", "Running step '{}': {}", step.name, step.command);
            let started = Instant::now();
            let outcome = self.runner.run(step, &self.options.source_dir);
            let duration_ms = started.elapsed().as_millis() as u64;

            if outcome.success {
                reports.push(StepReport {
                    name: step.name.clone(),
                    mode: step.mode,
                    status: StepStatus::Succeeded,
                    exit_code: outcome.exit_code,
                    duration_ms,
                    detail: None,
                });
                continue;
            }

            match step.mode {
                StepMode::Required => {
                    log_status!("build", "Step '{}' failed", step.name);
                    return Err(Error::build_step_failed(
                        &step.name,
                        outcome.diagnostic,
                        outcome.exit_code,
                    ));
                }
                StepMode::BestEffort => {
                    log_status!(
                        "build",
                        "Step '{}' failed (best effort, continuing)",
                        step.name
                    );
                    diagnostics.push(Diagnostic {
                        source: step.name.clone(),
                        message: outcome.diagnostic.clone(),
                    });
                    reports.push(StepReport {
                        name: step.name.clone(),
                        mode: step.mode,
                        status: StepStatus::Warned,
                        exit_code: outcome.exit_code,
                        duration_ms,
                        detail: Some(outcome.diagnostic),
                    });
                }
            }
        }

        Ok(reports)
    }

    fn probe_toolchain(&self, diagnostics: &mut Vec<Diagnostic>) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        for (tool, command) in &self.options.toolchain {
            let output = execute_local_command_in_dir(
                command,
                Some(&self.options.source_dir),
                None,
                Some(self.options.probe_timeout),
            );
            let version = output
                .success
                .then(|| output.first_line().map(str::to_string))
                .flatten();

            match version {
                Some(version) => {
                    versions.insert(tool.clone(), version);
                }
                None => {
                    diagnostics.push(Diagnostic {
                        source: format!("toolchain:{}", tool),
                        message: format!("'{}' did not report a version", command),
                    });
                    versions.insert(tool.clone(), UNAVAILABLE.to_string());
                }
            }
        }
        versions
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        name: &str,
        built_at: DateTime<Utc>,
        source: &SourceInfo,
        toolchain_versions: BTreeMap<String, String>,
        steps: Vec<StepReport>,
        diagnostics: Vec<Diagnostic>,
        partial_archive: &Path,
        partial_manifest: &Path,
        final_path: &Path,
        manifest_path: &Path,
    ) -> Result<BuildManifest> {
        let mut excludes = self.options.excludes.clone();
        if let Ok(relative) = self.options.artifact_dir.strip_prefix(&self.options.source_dir) {
            let relative = relative.to_string_lossy().replace('\\', "/");
            if !relative.is_empty() {
                excludes.push(format!("/{}", relative));
            }
        }

        let summary = archive::pack_tree(
            &self.options.source_dir,
            &[".".to_string()],
            &excludes,
            partial_archive,
        )?;
        let sha256 = archive::sha256_file(partial_archive)?;

        let manifest = BuildManifest {
            build_timestamp: built_at,
            source_revision: source.revision.clone(),
            source_branch: source.branch.clone(),
            artifact_name: name.to_string(),
            toolchain_versions,
            sha256,
            file_count: summary.file_count,
            steps,
            diagnostics,
        };

        let content = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize manifest".to_string())))?;
        fs::write(partial_manifest, content).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("write {}", partial_manifest.display())))
        })?;

        fs::rename(partial_archive, final_path).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("publish {}", final_path.display())))
        })?;
        if let Err(e) = fs::rename(partial_manifest, manifest_path) {
            let _ = fs::remove_file(final_path);
            return Err(Error::internal_io(
                e.to_string(),
                Some(format!("publish {}", manifest_path.display())),
            ));
        }

        Ok(manifest)
    }
}

// === Loading ===

/// Load an artifact from its archive or manifest path.
pub fn load_artifact(path: &Path) -> Result<(BuildArtifact, BuildManifest)> {
    let (archive_path, manifest_path) = if artifact::is_manifest(path) {
        let archive_path = artifact::archive_path_for(path)
            .ok_or_else(|| Error::artifact_not_found(path.display().to_string()))?;
        (archive_path, path.to_path_buf())
    } else {
        (path.to_path_buf(), artifact::manifest_path_for(path))
    };

    if !archive_path.is_file() || !manifest_path.is_file() {
        return Err(Error::artifact_not_found(path.display().to_string()));
    }

    let manifest = read_manifest(&manifest_path)?;
    Ok((
        BuildArtifact {
            name: manifest.artifact_name.clone(),
            path: archive_path,
            manifest_path,
            sha256: manifest.sha256.clone(),
        },
        manifest,
    ))
}

fn read_manifest(path: &Path) -> Result<BuildManifest> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::internal_json(e.to_string(), Some(format!("parse {}", path.display())))
    })
}

/// Newest published artifact in `dir`, by build timestamp.
pub fn latest_artifact(dir: &Path) -> Result<(BuildArtifact, BuildManifest)> {
    let pattern = dir.join(format!("*{}", artifact::MANIFEST_SUFFIX));
    let pattern = pattern.to_string_lossy().to_string();

    let mut candidates: Vec<(BuildArtifact, BuildManifest)> = glob::glob(&pattern)
        .map_err(|e| {
            Error::validation_invalid_argument(
                "artifactDir",
                format!("Invalid artifact directory '{}': {}", dir.display(), e),
                None,
                None,
            )
        })?
        .filter_map(|entry| entry.ok())
        .filter_map(|manifest| load_artifact(&manifest).ok())
        .collect();

    candidates.sort_by(|a, b| {
        a.1.build_timestamp
            .cmp(&b.1.build_timestamp)
            .then_with(|| a.0.name.cmp(&b.0.name))
    });

    candidates
        .pop()
        .ok_or_else(|| Error::artifact_not_found(format!("{}/*.{}", dir.display(), ARCHIVE_EXTENSION)))
}

/// Recompute the archive checksum and compare it with the manifest.
pub fn verify_integrity(artifact: &BuildArtifact) -> Result<()> {
    if !artifact.path.is_file() {
        return Err(Error::artifact_not_found(artifact.path.display().to_string()));
    }
    let actual = archive::sha256_file(&artifact.path)?;
    if actual != artifact.sha256 {
        return Err(Error::integrity_mismatch(&artifact.name, &artifact.sha256, actual));
    }
    Ok(())
}
