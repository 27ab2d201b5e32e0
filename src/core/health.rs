//! Post-deploy health verification.
//!
//! Every check is an independent [`HealthCheck`]. The verifier runs the
//! requested set concurrently, waits for all of them (or the deadline) and
//! folds the statuses into one [`OverallStatus`].

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::defaults::HealthConfig;
use crate::environment::EnvironmentConfig;
use crate::transport::DeployBackend;
use crate::utils::command::CommandOutput;
use crate::utils::shell;

/// Extra time the verifier waits past the per-check timeout before it stops
/// collecting results.
const COLLECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Connectivity,
    Runtime,
    Extensions,
    WritableState,
    Dependencies,
    BackingStore,
}

impl CheckName {
    pub fn all() -> &'static [CheckName] {
        &[
            CheckName::Connectivity,
            CheckName::Runtime,
            CheckName::Extensions,
            CheckName::WritableState,
            CheckName::Dependencies,
            CheckName::BackingStore,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::Connectivity => "connectivity",
            CheckName::Runtime => "runtime",
            CheckName::Extensions => "extensions",
            CheckName::WritableState => "writable_state",
            CheckName::Dependencies => "dependencies",
            CheckName::BackingStore => "backing_store",
        }
    }

    pub fn parse(value: &str) -> Option<CheckName> {
        let value = value.trim().to_lowercase().replace('-', "_");
        Self::all().iter().copied().find(|name| name.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pass,
    WarnOnly,
    Fail,
}

/// What a check reports: a status and a line a human can act on.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    pub fn warn(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self::fail(format!("timed out after {}s", timeout.as_secs_f64()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: CheckName,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub environment: String,
    pub checks: Vec<CheckResult>,
    pub overall: OverallStatus,
}

impl HealthReport {
    pub fn failed_checks(&self) -> Vec<String> {
        self.with_status(CheckStatus::Fail)
    }

    pub fn warned_checks(&self) -> Vec<String> {
        self.with_status(CheckStatus::Warn)
    }

    fn with_status(&self, status: CheckStatus) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| check.status == status)
            .map(|check| format!("{}: {}", check.name.as_str(), check.detail))
            .collect()
    }
}

/// `Fail` if any check failed, else `WarnOnly` if any warned, else `Pass`.
pub fn aggregate(checks: &[CheckResult]) -> OverallStatus {
    if checks.iter().any(|c| c.status == CheckStatus::Fail) {
        OverallStatus::Fail
    } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
        OverallStatus::WarnOnly
    } else {
        OverallStatus::Pass
    }
}

/// Everything a check may look at. Checks only read from the target.
#[derive(Clone)]
pub struct ProbeTarget {
    pub environment: EnvironmentConfig,
    pub backend: Arc<dyn DeployBackend>,
}

pub trait HealthCheck: Send + Sync {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome;
}

pub struct HealthVerifier {
    checks: BTreeMap<CheckName, Arc<dyn HealthCheck>>,
    timeout: Duration,
}

impl HealthVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: BTreeMap::new(),
            timeout,
        }
    }

    pub fn with_check(mut self, name: CheckName, check: impl HealthCheck + 'static) -> Self {
        self.checks.insert(name, Arc::new(check));
        self
    }

    /// Verifier with the built-in probe for every check name.
    pub fn standard(config: &HealthConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs))
            .with_check(
                CheckName::Connectivity,
                HttpProbe {
                    fallback_url: config.url.clone(),
                },
            )
            .with_check(
                CheckName::Runtime,
                RuntimeCheck {
                    command: config.runtime_command.clone(),
                },
            )
            .with_check(
                CheckName::Extensions,
                ExtensionsCheck {
                    list_command: config.extension_list_command.clone(),
                    required: config.extensions.clone(),
                    optional: config.optional_extensions.clone(),
                },
            )
            .with_check(
                CheckName::WritableState,
                PathCheck::writable(config.writable_dirs.clone()),
            )
            .with_check(
                CheckName::Dependencies,
                PathCheck::present(config.dependency_markers.clone()),
            )
            .with_check(
                CheckName::BackingStore,
                BackingStoreCheck {
                    address: config.store.address.clone(),
                    command: config.store.command.clone(),
                },
            )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every requested check and aggregate. Never fails: a check that
    /// panics reports `Fail` with its panic message, and one still running at
    /// the deadline reports `Fail` as timed out.
    pub fn verify(&self, target: &ProbeTarget, requested: &[CheckName]) -> HealthReport {
        let mut names: Vec<CheckName> = Vec::with_capacity(requested.len());
        for name in requested {
            if !names.contains(name) {
                names.push(*name);
            }
        }

        log_status!(
            "health",
            "Running {} check(s) against '{}'",
            names.len(),
            target.environment.name
        );

        let (tx, rx) = mpsc::channel::<(usize, CheckOutcome)>();
        let mut outcomes: Vec<Option<CheckOutcome>> = vec![None; names.len()];

        for (index, name) in names.iter().enumerate() {
            let Some(check) = self.checks.get(name) else {
                outcomes[index] = Some(CheckOutcome::fail("no probe registered for this check"));
                continue;
            };
            let check = Arc::clone(check);
            let target = target.clone();
            let tx = tx.clone();
            let timeout = self.timeout;
            thread::spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| check.run(&target, timeout)))
                    .unwrap_or_else(|payload| CheckOutcome::fail(panic_detail(&*payload)));
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout + COLLECT_GRACE;
        while outcomes.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(_) => break,
            }
        }

        let checks: Vec<CheckResult> = names
            .iter()
            .zip(outcomes)
            .map(|(name, outcome)| {
                let outcome = outcome.unwrap_or_else(|| CheckOutcome::timed_out(self.timeout));
                log_status!("health", "{}: {:?} {}", name.as_str(), outcome.status, outcome.detail);
                CheckResult {
                    name: *name,
                    status: outcome.status,
                    detail: outcome.detail,
                }
            })
            .collect();

        let overall = aggregate(&checks);
        HealthReport {
            environment: target.environment.name.clone(),
            checks,
            overall,
        }
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("check aborted: {}", message)
}

fn command_failure(output: &CommandOutput, timeout: Duration) -> CheckOutcome {
    if output.timed_out {
        CheckOutcome::timed_out(timeout)
    } else {
        CheckOutcome::fail(format!("exit {}: {}", output.exit_code, output.tail(3)))
    }
}

// === Standard checks ===

/// HTTP liveness probe. Redirects are not followed; 2xx and 3xx pass.
pub struct HttpProbe {
    pub fallback_url: Option<String>,
}

impl HealthCheck for HttpProbe {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome {
        let Some(url) = target
            .environment
            .health_url
            .clone()
            .or_else(|| self.fallback_url.clone())
        else {
            return CheckOutcome::warn("no health URL configured");
        };

        let client = match reqwest::blocking::Client::builder()
            .user_agent(format!("stagehand/{}", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => return CheckOutcome::fail(format!("could not create HTTP client: {}", e)),
        };

        match client.get(&url).send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    CheckOutcome::pass(format!("{} answered {}", url, status.as_u16()))
                } else {
                    CheckOutcome::fail(format!("{} answered {}", url, status.as_u16()))
                }
            }
            Err(e) if e.is_timeout() => CheckOutcome::timed_out(timeout),
            Err(e) => CheckOutcome::fail(format!("{} unreachable: {}", url, e)),
        }
    }
}

/// Runtime prerequisite: the command must succeed; its first line is the
/// detail.
pub struct RuntimeCheck {
    pub command: String,
}

impl HealthCheck for RuntimeCheck {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome {
        let output = target.backend.run(&self.command, timeout);
        if output.success {
            CheckOutcome::pass(output.first_line().unwrap_or("available").to_string())
        } else {
            command_failure(&output, timeout)
        }
    }
}

/// Compares a module listing against required and optional names.
pub struct ExtensionsCheck {
    pub list_command: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl HealthCheck for ExtensionsCheck {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome {
        let output = target.backend.run(&self.list_command, timeout);
        if !output.success {
            return command_failure(&output, timeout);
        }

        let present: Vec<String> = output
            .stdout
            .lines()
            .map(|line| line.trim().to_lowercase())
            .filter(|line| !line.is_empty())
            .collect();
        let missing = |names: &[String]| -> Vec<String> {
            names
                .iter()
                .filter(|name| !present.contains(&name.to_lowercase()))
                .cloned()
                .collect()
        };

        let missing_required = missing(&self.required);
        if !missing_required.is_empty() {
            return CheckOutcome::fail(format!("missing: {}", missing_required.join(", ")));
        }
        let missing_optional = missing(&self.optional);
        if !missing_optional.is_empty() {
            return CheckOutcome::warn(format!(
                "optional missing: {}",
                missing_optional.join(", ")
            ));
        }
        CheckOutcome::pass(format!("{} required present", self.required.len()))
    }
}

/// Paths under the environment root that must exist (and optionally be
/// writable directories).
pub struct PathCheck {
    pub paths: Vec<String>,
    pub writable: bool,
}

impl PathCheck {
    pub fn writable(paths: Vec<String>) -> Self {
        Self {
            paths,
            writable: true,
        }
    }

    pub fn present(paths: Vec<String>) -> Self {
        Self {
            paths,
            writable: false,
        }
    }

    fn script(&self) -> String {
        self.paths
            .iter()
            .map(|path| {
                let quoted = shell::quote_path(path);
                if self.writable {
                    format!("{{ test -d {q} && test -w {q}; }} || echo {q}", q = quoted)
                } else {
                    format!("test -e {q} || echo {q}", q = quoted)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl HealthCheck for PathCheck {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome {
        if self.paths.is_empty() {
            return CheckOutcome::pass("nothing to check");
        }

        let output = target.backend.run(&self.script(), timeout);
        if !output.success {
            return command_failure(&output, timeout);
        }

        let failing: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if failing.is_empty() {
            CheckOutcome::pass(self.paths.join(", "))
        } else if self.writable {
            CheckOutcome::fail(format!("not writable: {}", failing.join(", ")))
        } else {
            CheckOutcome::fail(format!("missing: {}", failing.join(", ")))
        }
    }
}

/// Backing store reachability, by TCP connect or by a command on the target.
pub struct BackingStoreCheck {
    pub address: Option<String>,
    pub command: Option<String>,
}

impl HealthCheck for BackingStoreCheck {
    fn run(&self, target: &ProbeTarget, timeout: Duration) -> CheckOutcome {
        if let Some(address) = &self.address {
            return probe_tcp(address, timeout);
        }
        if let Some(command) = &self.command {
            let output = target.backend.run(command, timeout);
            return if output.success {
                CheckOutcome::pass(
                    output
                        .first_line()
                        .map(str::to_string)
                        .unwrap_or_else(|| "reachable".to_string()),
                )
            } else {
                command_failure(&output, timeout)
            };
        }
        CheckOutcome::warn("no backing store configured")
    }
}

fn probe_tcp(address: &str, timeout: Duration) -> CheckOutcome {
    let addrs = match address.to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => return CheckOutcome::fail(format!("cannot resolve {}: {}", address, e)),
    };

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return CheckOutcome::pass(format!("{} reachable", address)),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return CheckOutcome::timed_out(timeout)
            }
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    CheckOutcome::fail(format!(
        "{} unreachable: {}",
        address,
        last_error.unwrap_or_else(|| "no addresses".to_string())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBackend;
    use std::fs;
    use std::net::TcpListener;
    use tempfile::TempDir;

    struct Fixed(CheckOutcome);

    impl HealthCheck for Fixed {
        fn run(&self, _target: &ProbeTarget, _timeout: Duration) -> CheckOutcome {
            self.0.clone()
        }
    }

    struct Hangs;

    impl HealthCheck for Hangs {
        fn run(&self, _target: &ProbeTarget, _timeout: Duration) -> CheckOutcome {
            thread::sleep(Duration::from_secs(5));
            CheckOutcome::pass("late")
        }
    }

    struct Panics;

    impl HealthCheck for Panics {
        fn run(&self, _target: &ProbeTarget, _timeout: Duration) -> CheckOutcome {
            panic!("null handle");
        }
    }

    fn target(root: &TempDir) -> ProbeTarget {
        ProbeTarget {
            environment: EnvironmentConfig {
                name: "staging".to_string(),
                host: "localhost".to_string(),
                path: root.path().to_string_lossy().to_string(),
                user: "deploy".to_string(),
                requires_confirmation: false,
                production_class: false,
                port: 22,
                identity_file: None,
                backup_paths: vec![".".to_string()],
                health_url: None,
                post_deploy: None,
            },
            backend: Arc::new(LocalBackend::new(root.path(), root.path().join(".incoming"))),
        }
    }

    fn result(status: CheckStatus) -> CheckResult {
        CheckResult {
            name: CheckName::Runtime,
            status,
            detail: String::new(),
        }
    }

    #[test]
    fn aggregation_follows_worst_status() {
        use CheckStatus::*;
        assert_eq!(aggregate(&[]), OverallStatus::Pass);
        assert_eq!(aggregate(&[result(Pass), result(Pass)]), OverallStatus::Pass);
        assert_eq!(aggregate(&[result(Pass), result(Warn)]), OverallStatus::WarnOnly);
        assert_eq!(aggregate(&[result(Warn), result(Fail)]), OverallStatus::Fail);
        assert_eq!(aggregate(&[result(Fail), result(Pass)]), OverallStatus::Fail);
    }

    #[test]
    fn failing_check_does_not_stop_others() {
        let root = TempDir::new().unwrap();
        let verifier = HealthVerifier::new(Duration::from_secs(2))
            .with_check(CheckName::Runtime, Fixed(CheckOutcome::fail("php missing")))
            .with_check(CheckName::Dependencies, Fixed(CheckOutcome::pass("ok")))
            .with_check(CheckName::BackingStore, Fixed(CheckOutcome::warn("none")));

        let report = verifier.verify(
            &target(&root),
            &[CheckName::Runtime, CheckName::Dependencies, CheckName::BackingStore],
        );
        assert_eq!(report.checks.len(), 3);
        assert_eq!(report.checks[0].name, CheckName::Runtime);
        assert_eq!(report.checks[1].status, CheckStatus::Pass);
        assert_eq!(report.overall, OverallStatus::Fail);
        assert_eq!(report.failed_checks(), vec!["runtime: php missing".to_string()]);
    }

    #[test]
    fn slow_and_broken_checks_fail_without_hanging() {
        let root = TempDir::new().unwrap();
        let verifier = HealthVerifier::new(Duration::from_millis(200))
            .with_check(CheckName::Runtime, Hangs)
            .with_check(CheckName::Extensions, Panics)
            .with_check(CheckName::Dependencies, Fixed(CheckOutcome::pass("ok")));

        let started = Instant::now();
        let report = verifier.verify(
            &target(&root),
            &[CheckName::Runtime, CheckName::Extensions, CheckName::Dependencies],
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(report.checks[0].detail.contains("timed out"));
        assert_eq!(report.checks[1].status, CheckStatus::Fail);
        assert_eq!(report.checks[2].status, CheckStatus::Pass);
    }

    #[test]
    fn panicking_check_reports_its_cause_without_waiting() {
        let root = TempDir::new().unwrap();
        let verifier = HealthVerifier::new(Duration::from_secs(30))
            .with_check(CheckName::Extensions, Panics)
            .with_check(CheckName::Dependencies, Fixed(CheckOutcome::pass("ok")));

        let started = Instant::now();
        let report = verifier.verify(&target(&root), &[CheckName::Extensions, CheckName::Dependencies]);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.checks[0].status, CheckStatus::Fail);
        assert_eq!(report.checks[0].detail, "check aborted: null handle");
        assert!(!report.checks[0].detail.contains("timed out"));
        assert_eq!(report.overall, OverallStatus::Fail);
    }

    #[test]
    fn unregistered_check_fails_and_duplicates_collapse() {
        let root = TempDir::new().unwrap();
        let verifier = HealthVerifier::new(Duration::from_secs(1));
        let report = verifier.verify(
            &target(&root),
            &[CheckName::BackingStore, CheckName::BackingStore],
        );
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.overall, OverallStatus::Fail);
    }

    #[test]
    fn path_checks_report_missing_entries() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("images")).unwrap();
        fs::create_dir_all(root.path().join("vendor")).unwrap();
        fs::write(root.path().join("vendor/autoload.php"), "<?php").unwrap();
        let target = target(&root);
        let timeout = Duration::from_secs(5);

        let writable = PathCheck::writable(vec!["images".into(), "cache".into()]).run(&target, timeout);
        assert_eq!(writable.status, CheckStatus::Fail);
        assert_eq!(writable.detail, "not writable: cache");

        let deps = PathCheck::present(vec!["vendor/autoload.php".into()]).run(&target, timeout);
        assert_eq!(deps.status, CheckStatus::Pass);
    }

    #[test]
    fn extension_listing_distinguishes_required_from_optional() {
        let root = TempDir::new().unwrap();
        let target = target(&root);
        let check = |optional: &str| ExtensionsCheck {
            list_command: "printf 'Core\\nmbstring\\nxml\\n'".to_string(),
            required: vec!["mbstring".into(), "XML".into()],
            optional: vec![optional.to_string()],
        };

        let outcome = check("apcu").run(&target, Duration::from_secs(5));
        assert_eq!(outcome.status, CheckStatus::Warn);
        assert_eq!(outcome.detail, "optional missing: apcu");

        let outcome = check("core").run(&target, Duration::from_secs(5));
        assert_eq!(outcome.status, CheckStatus::Pass);
    }

    #[test]
    fn runtime_check_reports_first_line_or_timeout() {
        let root = TempDir::new().unwrap();
        let target = target(&root);

        let ok = RuntimeCheck {
            command: "echo 'PHP 8.2.1 (cli)'".to_string(),
        }
        .run(&target, Duration::from_secs(5));
        assert_eq!(ok, CheckOutcome::pass("PHP 8.2.1 (cli)"));

        let slow = RuntimeCheck {
            command: "sleep 5".to_string(),
        }
        .run(&target, Duration::from_millis(200));
        assert_eq!(slow.status, CheckStatus::Fail);
        assert!(slow.detail.starts_with("timed out"));
    }

    #[test]
    fn backing_store_probe_connects_over_tcp() {
        let root = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let check = BackingStoreCheck {
            address: Some(address),
            command: None,
        };
        assert_eq!(
            check.run(&target(&root), Duration::from_secs(2)).status,
            CheckStatus::Pass
        );

        let unconfigured = BackingStoreCheck {
            address: None,
            command: None,
        };
        assert_eq!(
            unconfigured.run(&target(&root), Duration::from_secs(2)).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn connectivity_without_url_warns() {
        let root = TempDir::new().unwrap();
        let probe = HttpProbe { fallback_url: None };
        assert_eq!(
            probe.run(&target(&root), Duration::from_secs(1)).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn check_names_parse_loosely() {
        assert_eq!(CheckName::parse("writable-state"), Some(CheckName::WritableState));
        assert_eq!(CheckName::parse("Runtime"), Some(CheckName::Runtime));
        assert_eq!(CheckName::parse("nope"), None);
    }
}
