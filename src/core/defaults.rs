use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::deploy::PostDeployKind;
use crate::error::{Error, Result};
use crate::health::CheckName;

/// Root configuration structure for stagehand.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagehandConfig {
    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default = "default_build")]
    pub build: BuildConfig,

    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentEntry>,

    #[serde(default = "default_backup")]
    pub backup: BackupConfig,

    #[serde(default = "default_deploy")]
    pub deploy: DeployConfig,

    #[serde(default = "default_health")]
    pub health: HealthConfig,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            project: ProjectConfig::default(),
            build: default_build(),
            environments: BTreeMap::new(),
            backup: default_backup(),
            deploy: default_deploy(),
            health: default_health(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Prefix for artifact file names.
    #[serde(default = "default_project_name")]
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    #[serde(default = "default_build_steps")]
    pub steps: Vec<BuildStepConfig>,

    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Tool name -> command whose first output line is the version.
    #[serde(default = "default_toolchain")]
    pub toolchain: BTreeMap<String, String>,

    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildStepConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// One named target as written in stagehand.json. Every field may be
/// overridden from the process environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_class: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_deploy: Option<Vec<PostDeployTaskConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Paths, relative to the environment root, captured before each deploy.
    #[serde(default = "default_backup_paths")]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    #[serde(default)]
    pub post_deploy: Vec<PostDeployTaskConfig>,

    /// Restore the pre-deploy backup when transfer or apply fails.
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,

    #[serde(default)]
    pub post_deploy_failure: PostDeployFailurePolicy,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostDeployTaskConfig {
    pub kind: PostDeployKind,
    pub command: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostDeployFailurePolicy {
    /// Keep the deployment and report the failed task.
    #[default]
    Report,
    /// Restore the pre-deploy backup.
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_checks")]
    pub checks: Vec<CheckName>,

    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,

    #[serde(default = "default_extension_list_command")]
    pub extension_list_command: String,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_optional_extensions")]
    pub optional_extensions: Vec<String>,

    #[serde(default = "default_writable_dirs")]
    pub writable_dirs: Vec<String>,

    #[serde(default = "default_dependency_markers")]
    pub dependency_markers: Vec<String>,

    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// `host:port` probed with a TCP connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Command run on the target; zero exit means reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_project_name() -> String {
    "site".to_string()
}

fn default_build() -> BuildConfig {
    BuildConfig {
        source_dir: default_source_dir(),
        artifact_dir: default_artifact_dir(),
        steps: default_build_steps(),
        excludes: default_excludes(),
        toolchain: default_toolchain(),
        step_timeout_secs: default_step_timeout_secs(),
    }
}

fn default_source_dir() -> String {
    ".".to_string()
}

fn default_artifact_dir() -> String {
    "dist".to_string()
}

fn default_build_steps() -> Vec<BuildStepConfig> {
    vec![
        BuildStepConfig {
            name: "install".to_string(),
            command: "composer install --no-dev --no-interaction --prefer-dist".to_string(),
            best_effort: false,
            timeout_secs: None,
        },
        BuildStepConfig {
            name: "compile".to_string(),
            command: "npm ci && npm run build".to_string(),
            best_effort: true,
            timeout_secs: None,
        },
    ]
}

fn default_excludes() -> Vec<String> {
    [
        ".git",
        ".github",
        "/.stagehand",
        "/dist",
        "node_modules",
        "/tests",
        "*.log",
        ".env",
        "secrets/*",
        "/stagehand.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_toolchain() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("php".to_string(), "php --version".to_string()),
        ("composer".to_string(), "composer --version".to_string()),
        ("node".to_string(), "node --version".to_string()),
    ])
}

fn default_step_timeout_secs() -> u64 {
    900
}

fn default_backup() -> BackupConfig {
    BackupConfig {
        paths: default_backup_paths(),
    }
}

fn default_backup_paths() -> Vec<String> {
    vec![".".to_string()]
}

fn default_deploy() -> DeployConfig {
    DeployConfig {
        post_deploy: Vec::new(),
        auto_rollback: default_auto_rollback(),
        post_deploy_failure: PostDeployFailurePolicy::default(),
        command_timeout_secs: default_command_timeout_secs(),
    }
}

fn default_auto_rollback() -> bool {
    true
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_health() -> HealthConfig {
    HealthConfig {
        checks: default_checks(),
        timeout_secs: default_probe_timeout_secs(),
        url: None,
        runtime_command: default_runtime_command(),
        extension_list_command: default_extension_list_command(),
        extensions: default_extensions(),
        optional_extensions: default_optional_extensions(),
        writable_dirs: default_writable_dirs(),
        dependency_markers: default_dependency_markers(),
        store: StoreConfig::default(),
    }
}

fn default_checks() -> Vec<CheckName> {
    CheckName::all().to_vec()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_runtime_command() -> String {
    "php --version".to_string()
}

fn default_extension_list_command() -> String {
    "php -m".to_string()
}

fn default_extensions() -> Vec<String> {
    vec![
        "mbstring".to_string(),
        "xml".to_string(),
        "intl".to_string(),
    ]
}

fn default_optional_extensions() -> Vec<String> {
    vec!["apcu".to_string()]
}

fn default_writable_dirs() -> Vec<String> {
    vec!["images".to_string(), "cache".to_string()]
}

fn default_dependency_markers() -> Vec<String> {
    vec!["vendor/autoload.php".to_string()]
}

fn default_state_dir() -> String {
    ".stagehand".to_string()
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load stagehand.json. A missing file yields built-in defaults; a malformed
/// one is a configuration error.
pub fn load_config(path: &Path) -> Result<StagehandConfig> {
    if !path.exists() {
        return Ok(StagehandConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;

    let config: StagehandConfig = serde_json::from_str(&content)
        .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &StagehandConfig) -> Result<()> {
    if config.project.name.trim().is_empty() {
        return Err(Error::config_invalid_value(
            "project.name",
            None,
            "must not be empty",
        ));
    }

    let mut seen = std::collections::BTreeSet::new();
    for step in &config.build.steps {
        if step.name.trim().is_empty() || step.command.trim().is_empty() {
            return Err(Error::config_invalid_value(
                "build.steps",
                Some(step.name.clone()),
                "every step needs a name and a command",
            ));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(Error::config_invalid_value(
                "build.steps",
                Some(step.name.clone()),
                "step names must be unique",
            ));
        }
    }

    if config.build.step_timeout_secs == 0 {
        return Err(Error::config_invalid_value(
            "build.stepTimeoutSecs",
            Some("0".to_string()),
            "must be greater than zero",
        ));
    }

    if config.health.timeout_secs == 0 {
        return Err(Error::config_invalid_value(
            "health.timeoutSecs",
            Some("0".to_string()),
            "must be greater than zero",
        ));
    }

    Ok(())
}

/// Get built-in defaults (ignoring any file config)
pub fn builtin_defaults() -> StagehandConfig {
    StagehandConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::utils::archive::ExcludeSet;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("stagehand.json")).unwrap();
        assert_eq!(config.state_dir, ".stagehand");
        assert!(config.deploy.auto_rollback);
        assert_eq!(config.deploy.post_deploy_failure, PostDeployFailurePolicy::Report);
        assert_eq!(config.build.steps.len(), 2);
        assert!(config.build.steps[1].best_effort);
    }

    #[test]
    fn builtin_excludes_only_drop_top_level_build_dirs() {
        let excludes = ExcludeSet::new(builtin_defaults().build.excludes);
        assert!(excludes.is_excluded("dist/wiki.zip"));
        assert!(excludes.is_excluded("tests/phpunit/bootstrap.php"));
        assert!(excludes.is_excluded("stagehand.json"));
        assert!(excludes.is_excluded("skins/node_modules/x.js"));
        assert!(!excludes.is_excluded("resources/lib/jquery/dist/jquery.js"));
        assert!(!excludes.is_excluded("vendor/wikimedia/at-ease/tests/a.php"));
        assert!(!excludes.is_excluded("extensions/Foo/stagehand.json"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.json");
        fs::write(
            &path,
            r#"{
                "project": {"name": "wiki"},
                "environments": {"staging": {"host": "localhost", "path": "/srv/wiki"}},
                "deploy": {"postDeployFailure": "rollback"}
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.project.name, "wiki");
        assert_eq!(
            config.environments["staging"].path.as_deref(),
            Some("/srv/wiki")
        );
        assert_eq!(config.deploy.post_deploy_failure, PostDeployFailurePolicy::Rollback);
        assert!(config.deploy.auto_rollback);
        assert_eq!(config.health.timeout_secs, 10);
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidJson);
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stagehand.json");
        fs::write(
            &path,
            r#"{"build": {"steps": [
                {"name": "install", "command": "true"},
                {"name": "install", "command": "true"}
            ]}}"#,
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }
}
