//! Verification of a workspace after a patch
//!
//! Each configured check (test, lint) runs as a shell command in the
//! workspace and yields its own pass/fail result. A report passes only when
//! every check passes; no configured checks passes vacuously.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::text::{combine_streams, tail};

/// Output kept per check for diagnostics
const MAX_CHECK_OUTPUT: usize = 16 * 1024;

/// Which check produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Test,
    Lint,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Test => "test",
            CheckKind::Lint => "lint",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn passed(kind: CheckKind, output: impl Into<String>) -> Self {
        Self {
            kind,
            success: true,
            output: output.into(),
            exit_code: 0,
            duration_ms: 0,
        }
    }

    pub fn failed(kind: CheckKind, exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            kind,
            success: false,
            output: output.into(),
            exit_code,
            duration_ms: 0,
        }
    }
}

/// All check results for one verification run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        Self { checks }
    }

    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.success)
    }

    pub fn failing(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.success)
    }

    pub fn failing_kinds(&self) -> Vec<CheckKind> {
        self.failing().map(|c| c.kind).collect()
    }

    /// Output of every failing check, labelled, for the next prompt
    pub fn failing_output(&self) -> String {
        self.failing()
            .map(|c| format!("## {} failed (exit code {})\n{}", c.kind, c.exit_code, c.output.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn duration_ms(&self) -> u64 {
        self.checks.iter().map(|c| c.duration_ms).sum()
    }
}

/// Runs the checks against a workspace
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, workspace: &Path) -> VerificationReport;
}

/// Verification commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    #[serde(rename = "test-command")]
    pub test_command: Option<String>,

    #[serde(rename = "lint-command")]
    pub lint_command: Option<String>,

    /// Per-check timeout
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            test_command: None,
            lint_command: None,
            timeout_ms: 600_000,
        }
    }
}

/// Verifier running shell commands via `sh -c`
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    checks: Vec<(CheckKind, String)>,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            timeout,
        }
    }

    pub fn from_config(config: &VerifyConfig) -> Self {
        debug!(?config, "CommandVerifier::from_config: called");
        let mut verifier = Self::new(Duration::from_millis(config.timeout_ms));
        if let Some(command) = &config.test_command {
            verifier = verifier.with_check(CheckKind::Test, command);
        }
        if let Some(command) = &config.lint_command {
            verifier = verifier.with_check(CheckKind::Lint, command);
        }
        verifier
    }

    pub fn with_check(mut self, kind: CheckKind, command: impl Into<String>) -> Self {
        self.checks.push((kind, command.into()));
        self
    }

    async fn run_check(&self, kind: CheckKind, command: &str, workspace: &Path) -> CheckResult {
        debug!(%kind, %command, workspace = %workspace.display(), "CommandVerifier::run_check: called");
        let start = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(%kind, error = %e, "Failed to start check");
                return CheckResult::failed(kind, -1, format!("Failed to start `{}`: {}", command, e));
            }
        };
        let pid = child.id();

        let mut result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let text = tail(&combine_streams(&stdout, &stderr), MAX_CHECK_OUTPUT).to_string();
                let code = output.status.code().unwrap_or(-1);
                if output.status.success() {
                    CheckResult::passed(kind, text)
                } else {
                    CheckResult::failed(kind, code, text)
                }
            }
            Ok(Err(e)) => CheckResult::failed(kind, -1, format!("Failed to run `{}`: {}", command, e)),
            Err(_) => {
                warn!(%kind, timeout_ms = self.timeout.as_millis() as u64, "Check timed out");
                kill_group(pid);
                CheckResult::failed(
                    kind,
                    -1,
                    format!("`{}` timed out after {}ms", command, self.timeout.as_millis()),
                )
            }
        };
        result.duration_ms = start.elapsed().as_millis() as u64;
        debug!(%kind, success = result.success, exit_code = result.exit_code, duration_ms = result.duration_ms, "CommandVerifier::run_check: done");
        result
    }
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, workspace: &Path) -> VerificationReport {
        debug!(check_count = self.checks.len(), "CommandVerifier::verify: called");
        let mut checks = Vec::with_capacity(self.checks.len());
        for (kind, command) in &self.checks {
            checks.push(self.run_check(*kind, command, workspace).await);
        }
        let report = VerificationReport::new(checks);
        info!(passed = report.all_passed(), failing = ?report.failing_kinds(), "Verification finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_all_checks_pass() {
        let temp = tempdir().unwrap();
        let verifier = CommandVerifier::new(Duration::from_secs(30))
            .with_check(CheckKind::Test, "echo tests ok")
            .with_check(CheckKind::Lint, "true");

        let report = verifier.verify(temp.path()).await;
        assert!(report.all_passed());
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks[0].output.contains("tests ok"));
    }

    #[tokio::test]
    async fn test_each_check_reported_independently() {
        let temp = tempdir().unwrap();
        let verifier = CommandVerifier::new(Duration::from_secs(30))
            .with_check(CheckKind::Test, "echo 'assertion failed' >&2; exit 101")
            .with_check(CheckKind::Lint, "true");

        let report = verifier.verify(temp.path()).await;
        assert!(!report.all_passed());
        assert_eq!(report.failing_kinds(), vec![CheckKind::Test]);
        assert_eq!(report.checks[0].exit_code, 101);
        assert!(report.checks[1].success);

        let diagnostics = report.failing_output();
        assert!(diagnostics.contains("## test failed (exit code 101)"));
        assert!(diagnostics.contains("assertion failed"));
        assert!(!diagnostics.contains("lint"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_check() {
        let temp = tempdir().unwrap();
        let verifier = CommandVerifier::new(Duration::from_millis(100)).with_check(CheckKind::Test, "sleep 10");

        let start = std::time::Instant::now();
        let report = verifier.verify(temp.path()).await;
        assert!(!report.all_passed());
        assert!(report.checks[0].output.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_checks_passes() {
        let temp = tempdir().unwrap();
        let verifier = CommandVerifier::from_config(&VerifyConfig::default());
        let report = verifier.verify(temp.path()).await;
        assert!(report.all_passed());
        assert!(report.checks.is_empty());
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("ok.txt"), "x").unwrap();
        let verifier = CommandVerifier::new(Duration::from_secs(30)).with_check(CheckKind::Test, "test -f ok.txt");
        assert!(verifier.verify(temp.path()).await.all_passed());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: VerifyConfig = serde_yaml::from_str("test-command: cargo test\ntimeout-ms: 1000").unwrap();
        let verifier = CommandVerifier::from_config(&config);
        assert_eq!(verifier.checks.len(), 1);
        assert_eq!(verifier.timeout, Duration::from_millis(1000));
    }
}
