use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::utils::command;

pub const UNKNOWN: &str = "unknown";

/// Revision and branch the build was produced from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub revision: String,
    pub branch: String,
}

/// Describe the checkout at `path`.
///
/// Falls back to CI-provided variables (`GITHUB_SHA`, `GITHUB_REF_NAME`,
/// `STAGEHAND_REVISION`, `STAGEHAND_BRANCH`) when the tree is not a git
/// checkout, and to `unknown` when nothing is available.
pub fn source_info(path: &Path) -> SourceInfo {
    let vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with("GITHUB_") || key.starts_with("STAGEHAND_"))
        .collect();
    source_info_with(path, &vars)
}

pub fn source_info_with(path: &Path, vars: &BTreeMap<String, String>) -> SourceInfo {
    let from_var = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| vars.get(*key))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    };

    let revision = command::run_in_optional(path, "git", &["rev-parse", "HEAD"])
        .or_else(|| from_var(&["STAGEHAND_REVISION", "GITHUB_SHA"]))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let branch = command::run_in_optional(path, "git", &["rev-parse", "--abbrev-ref", "HEAD"])
        .filter(|b| b != "HEAD")
        .or_else(|| from_var(&["STAGEHAND_BRANCH", "GITHUB_REF_NAME"]))
        .unwrap_or_else(|| UNKNOWN.to_string());

    SourceInfo { revision, branch }
}

/// True when `path` is a git checkout with uncommitted changes.
pub fn has_uncommitted_changes(path: &Path) -> bool {
    command::run_in_optional(path, "git", &["status", "--porcelain"]).is_some()
}

/// Short form of a revision for use in file names.
pub fn short_revision(revision: &str) -> String {
    let cleaned: String = revision
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    if cleaned.is_empty() {
        UNKNOWN.to_string()
    } else {
        cleaned.to_ascii_lowercase()
    }
}
