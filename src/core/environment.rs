//! Environment resolution.
//!
//! Environment configuration is captured once, from stagehand.json and the
//! process environment, into an [`EnvironmentRegistry`]. Resolving a name is
//! a pure lookup against that snapshot.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::defaults::{EnvironmentEntry, PostDeployTaskConfig, StagehandConfig};
use crate::error::{Error, Result};
use crate::paths;
use crate::ssh::is_local_host;

/// Names every installation recognizes, configured or not.
pub const FIXED_ENVIRONMENTS: &[&str] = &["staging", "production"];

/// Names treated as production-class when no explicit flag is set.
const PRODUCTION_NAMES: &[&str] = &["production", "prod", "live"];

/// Comma-separated list of extra environment names.
pub const ENVIRONMENTS_VAR: &str = "STAGEHAND_ENVIRONMENTS";

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub name: String,
    pub host: String,
    pub path: String,
    pub user: String,
    pub requires_confirmation: bool,
    pub production_class: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    pub backup_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_deploy: Option<Vec<PostDeployTaskConfig>>,
}

impl EnvironmentConfig {
    pub fn is_local(&self) -> bool {
        is_local_host(&self.host)
    }

    /// `user@host:path`, or just the path for local targets.
    pub fn target_label(&self) -> String {
        if self.is_local() {
            self.path.clone()
        } else {
            format!("{}@{}:{}", self.user, self.host, self.path)
        }
    }
}

pub fn is_production_name(name: &str) -> bool {
    PRODUCTION_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

const NAME_PATTERN: &str = r"^[a-z][a-z0-9_-]{0,62}$";

/// Prefix for per-environment overrides, e.g. `STAGEHAND_STAGING_`.
pub fn env_var_prefix(name: &str) -> String {
    format!("STAGEHAND_{}_", name.to_ascii_uppercase().replace('-', "_"))
}

/// Immutable snapshot of every resolvable environment.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    entries: BTreeMap<String, Result<EnvironmentConfig>>,
}

impl EnvironmentRegistry {
    /// Capture configuration from stagehand.json plus the current process
    /// environment.
    pub fn from_process(config: &StagehandConfig, base_dir: &Path) -> Result<Self> {
        let vars: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("STAGEHAND_") || key == "USER")
            .collect();
        Self::from_sources(config, &vars, base_dir)
    }

    /// Build the registry from explicit sources. Variables win over the file.
    pub fn from_sources(
        config: &StagehandConfig,
        vars: &BTreeMap<String, String>,
        base_dir: &Path,
    ) -> Result<Self> {
        let pattern = Regex::new(NAME_PATTERN)
            .map_err(|e| Error::internal_unexpected(format!("environment name pattern: {}", e)))?;
        let mut names: BTreeSet<String> = FIXED_ENVIRONMENTS.iter().map(|s| s.to_string()).collect();

        for name in config.environments.keys() {
            names.insert(validate_name(&pattern, name)?);
        }

        if let Some(extra) = vars.get(ENVIRONMENTS_VAR) {
            for name in extra.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                names.insert(validate_name(&pattern, name)?);
            }
        }

        let mut file_entries: BTreeMap<String, &EnvironmentEntry> = BTreeMap::new();
        for (name, entry) in &config.environments {
            file_entries.insert(name.to_ascii_lowercase(), entry);
        }

        let empty = EnvironmentEntry::default();
        let entries = names
            .into_iter()
            .map(|name| {
                let entry = file_entries.get(&name).copied().unwrap_or(&empty);
                let resolved = build_config(&name, entry, config, vars, base_dir);
                (name, resolved)
            })
            .collect();

        Ok(Self { entries })
    }

    /// Every recognized name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Case-insensitive lookup. Unknown names never fall back to a default.
    pub fn resolve(&self, name: &str) -> Result<EnvironmentConfig> {
        let key = name.trim().to_ascii_lowercase();
        match self.entries.get(&key) {
            Some(resolved) => resolved.clone(),
            None => Err(Error::environment_unknown(name, self.names())),
        }
    }

    /// Resolution outcome for every recognized name.
    pub fn all(&self) -> impl Iterator<Item = (&str, &Result<EnvironmentConfig>)> {
        self.entries.iter().map(|(name, resolved)| (name.as_str(), resolved))
    }
}

fn validate_name(pattern: &Regex, name: &str) -> Result<String> {
    let lowered = name.trim().to_ascii_lowercase();
    if !pattern.is_match(&lowered) {
        return Err(Error::config_invalid_value(
            "environments",
            Some(name.to_string()),
            "environment names must start with a letter and contain only letters, digits, '-' or '_'",
        ));
    }
    Ok(lowered)
}

fn build_config(
    name: &str,
    entry: &EnvironmentEntry,
    config: &StagehandConfig,
    vars: &BTreeMap<String, String>,
    base_dir: &Path,
) -> Result<EnvironmentConfig> {
    let prefix = env_var_prefix(name);
    let var = |suffix: &str| -> Option<String> {
        vars.get(&format!("{}{}", prefix, suffix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let host = var("HOST")
        .or_else(|| entry.host.clone())
        .ok_or_else(|| missing_key(name, "host", &prefix))?;

    let raw_path = var("PATH")
        .or_else(|| entry.path.clone())
        .ok_or_else(|| missing_key(name, "path", &prefix))?;

    let local = is_local_host(&host);
    let path = if local {
        paths::resolve_against(base_dir, &raw_path)
            .to_string_lossy()
            .to_string()
    } else {
        raw_path
    };

    let user = match var("USER").or_else(|| entry.user.clone()) {
        Some(user) => user,
        None if local => vars.get("USER").cloned().unwrap_or_else(|| "local".to_string()),
        None => return Err(missing_key(name, "user", &prefix)),
    };

    let production_class = entry
        .production_class
        .unwrap_or_else(|| is_production_name(name));

    let requires_confirmation = match var("REQUIRE_CONFIRMATION") {
        Some(raw) => parse_flag(&raw).ok_or_else(|| {
            Error::config_invalid_value(
                format!("{}REQUIRE_CONFIRMATION", prefix),
                Some(raw.clone()),
                "expected true/false, yes/no, on/off or 1/0",
            )
        })?,
        None => entry.requires_confirmation.unwrap_or(production_class),
    };

    let port = match var("PORT") {
        Some(raw) => raw.parse::<u16>().map_err(|_| {
            Error::config_invalid_value(
                format!("{}PORT", prefix),
                Some(raw.clone()),
                "expected a TCP port number",
            )
        })?,
        None => entry.port.unwrap_or(DEFAULT_SSH_PORT),
    };

    let identity_file = var("IDENTITY_FILE").or_else(|| entry.identity_file.clone());

    let backup_paths = entry
        .backup_paths
        .clone()
        .unwrap_or_else(|| config.backup.paths.clone());
    if backup_paths.is_empty() {
        return Err(Error::config_invalid_value(
            format!("environments.{}.backupPaths", name),
            None,
            "at least one path must be captured before deploying",
        ));
    }

    let health_url = var("HEALTH_URL")
        .or_else(|| entry.health_url.clone())
        .or_else(|| config.health.url.clone());

    Ok(EnvironmentConfig {
        name: name.to_string(),
        host,
        path,
        user,
        requires_confirmation,
        production_class,
        port,
        identity_file,
        backup_paths,
        health_url,
        post_deploy: entry.post_deploy.clone(),
    })
}

fn missing_key(name: &str, key: &str, prefix: &str) -> Error {
    Error::config_missing_key(format!("environments.{}.{}", name, key), None).with_hint(format!(
        "Set it in stagehand.json or export {}{}",
        prefix,
        key.to_ascii_uppercase()
    ))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
