//! CliAdapter - runs an external agent CLI once per request

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::retry::ActivityMonitor;
use crate::text::{combine_streams, tail, truncate_output};

use super::adapter::{BackendOutput, InvokeOptions, ProviderAdapter, ProviderBase, ProviderCapabilities};
use super::classify::{ErrorClassifier, PatternConfig};
use super::error::ProviderError;
use super::redact::Redactor;
use super::reset::ResetParserKind;

/// Placeholder in `args` replaced by the prompt
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Grace period for output readers after the process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Env keys whose values are treated as secrets
const SECRET_ENV_HINTS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD"];

/// Configuration of one CLI backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub name: String,

    pub program: String,

    /// Arguments; `{prompt}` is replaced by the prompt, otherwise the prompt
    /// is written to stdin
    pub args: Vec<String>,

    pub env: BTreeMap<String, String>,

    /// Regex on stdout that marks the task as complete
    #[serde(rename = "completion-marker")]
    pub completion_marker: Option<String>,

    pub capabilities: ProviderCapabilities,

    /// Provider-specific error patterns, checked in order
    pub patterns: Vec<PatternConfig>,

    #[serde(rename = "reset-parser")]
    pub reset_parser: ResetParserKind,

    #[serde(rename = "kill-grace-ms")]
    pub kill_grace_ms: u64,

    #[serde(rename = "max-output-bytes")]
    pub max_output_bytes: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            program: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            completion_marker: None,
            capabilities: ProviderCapabilities::default(),
            patterns: Vec::new(),
            reset_parser: ResetParserKind::Auto,
            kill_grace_ms: 2_000,
            max_output_bytes: 256 * 1024,
        }
    }
}

impl AdapterConfig {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_marker = Some(marker.into());
        self
    }
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Killed,
}

/// Adapter over an external agent CLI
///
/// Each request spawns the program in the workspace as its own process
/// group, so a timeout or kill takes down everything it started.
#[derive(Debug)]
pub struct CliAdapter {
    base: ProviderBase,
    config: AdapterConfig,
    completion: Option<Regex>,
}

impl CliAdapter {
    pub fn from_config(config: AdapterConfig) -> Result<Self> {
        debug!(name = %config.name, program = %config.program, "CliAdapter::from_config: called");
        if config.name.is_empty() {
            return Err(eyre::eyre!("Adapter config is missing a name"));
        }
        if config.program.is_empty() {
            return Err(eyre::eyre!("Adapter {} is missing a program", config.name));
        }

        let classifier = ErrorClassifier::from_config(&config.patterns)
            .context(format!("Invalid error patterns for adapter {}", config.name))?;
        let completion = config
            .completion_marker
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context(format!("Invalid completion marker for adapter {}", config.name))?;

        let secrets = config
            .env
            .iter()
            .filter(|(key, _)| {
                let key = key.to_uppercase();
                SECRET_ENV_HINTS.iter().any(|hint| key.contains(hint))
            })
            .map(|(_, value)| value.clone());

        let base = ProviderBase::new(&config.name)
            .with_capabilities(config.capabilities.clone())
            .with_classifier(classifier)
            .with_redactor(Redactor::new().with_literals(secrets))
            .with_reset_parser(config.reset_parser.build());

        Ok(Self {
            base,
            config,
            completion,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Arguments with the prompt substituted, and whether stdin carries it
    fn render_args(&self, prompt: &str) -> (Vec<String>, bool) {
        let uses_placeholder = self.config.args.iter().any(|a| a.contains(PROMPT_PLACEHOLDER));
        let args = self
            .config
            .args
            .iter()
            .map(|a| a.replace(PROMPT_PLACEHOLDER, prompt))
            .collect();
        (args, !uses_placeholder)
    }

    /// SIGTERM the process group, then SIGKILL after the grace period
    async fn terminate(&self, child: &mut Child) {
        let grace = Duration::from_millis(self.config.kill_grace_ms);
        debug!(provider = %self.base.name, pid = ?child.id(), grace_ms = self.config.kill_grace_ms, "CliAdapter::terminate: called");

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let group = Pid::from_raw(pid as i32);
                if let Err(e) = killpg(group, Signal::SIGTERM) {
                    debug!(pid, error = %e, "CliAdapter::terminate: SIGTERM failed");
                }
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    warn!(provider = %self.base.name, pid, "Backend ignored SIGTERM, sending SIGKILL");
                }
                // stragglers in the group die with the leader
                let _ = killpg(group, Signal::SIGKILL);
            }
        }

        if let Err(e) = child.kill().await {
            debug!(error = %e, "CliAdapter::terminate: child already gone");
        }
    }
}

/// What a reader kept of one output stream
#[derive(Debug, Default)]
struct Captured {
    /// Last lines of the stream, within the byte cap
    tail: String,
    /// Bytes dropped from the front to stay within the cap
    dropped: usize,
    /// Some line matched the completion marker
    marker_seen: bool,
}

impl Captured {
    fn total_bytes(&self) -> usize {
        self.dropped + self.tail.len()
    }
}

/// Read a stream to the end, keeping a rolling tail of at most `max_bytes`
///
/// The completion marker is matched as lines arrive, so it is seen even when
/// the line itself falls out of the kept tail.
fn spawn_reader<R>(
    stream: Option<R>,
    activity: Option<ActivityMonitor>,
    marker: Option<Regex>,
    max_bytes: usize,
) -> JoinHandle<Captured>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Captured::default();
        let Some(stream) = stream else {
            return captured;
        };
        let mut kept: VecDeque<String> = VecDeque::new();
        let mut kept_bytes = 0;
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(activity) = &activity {
                activity.touch();
            }
            if !captured.marker_seen && marker.as_ref().is_some_and(|re| re.is_match(&line)) {
                captured.marker_seen = true;
            }
            kept_bytes += line.len() + 1;
            kept.push_back(line);
            while kept_bytes > max_bytes && kept.len() > 1 {
                if let Some(old) = kept.pop_front() {
                    kept_bytes -= old.len() + 1;
                    captured.dropped += old.len() + 1;
                }
            }
        }
        let mut tail = String::with_capacity(kept_bytes);
        for line in kept {
            tail.push_str(&line);
            tail.push('\n');
        }
        captured.tail = tail;
        captured
    })
}

async fn drain(handle: JoinHandle<Captured>) -> Captured {
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            debug!(error = %e, "drain: reader task failed");
            Captured::default()
        }
        Err(_) => {
            debug!("drain: reader still blocked, giving up");
            Captured::default()
        }
    }
}

/// Where `program` resolves to an executable, directly or through PATH
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[async_trait]
impl ProviderAdapter for CliAdapter {
    fn base(&self) -> &ProviderBase {
        &self.base
    }

    async fn available(&self) -> bool {
        let found = resolve_program(&self.config.program).is_some();
        debug!(provider = %self.base.name, program = %self.config.program, found, "CliAdapter::available: called");
        found
    }

    async fn send(&self, prompt: &str, options: &InvokeOptions) -> Result<BackendOutput, ProviderError> {
        debug!(
            provider = %self.base.name,
            workspace = %options.workspace.display(),
            timeout_ms = options.timeout.as_millis() as u64,
            prompt_len = prompt.len(),
            "CliAdapter::send: called"
        );

        let (args, use_stdin) = self.render_args(prompt);
        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .envs(&self.config.env)
            .current_dir(&options.workspace)
            .stdin(if use_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            self.base
                .error_of_kind(ErrorKind::Permanent, &format!("Failed to spawn {}: {}", self.config.program, e))
        })?;
        options.touch();

        if use_stdin && let Some(mut stdin) = child.stdin.take() {
            let input = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "CliAdapter::send: stdin write failed");
                }
                // dropping closes the pipe
            });
        }

        let max = self.config.max_output_bytes;
        let stdout = spawn_reader(child.stdout.take(), options.activity.clone(), self.completion.clone(), max);
        let stderr = spawn_reader(child.stderr.take(), options.activity.clone(), None, max);

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = tokio::time::sleep(options.timeout) => Finish::TimedOut,
            _ = options.kill.cancelled() => Finish::Killed,
        };

        let status = match finish {
            Finish::Exited(status) => status,
            Finish::TimedOut => {
                warn!(provider = %self.base.name, timeout_ms = options.timeout.as_millis() as u64, "Backend timed out");
                self.terminate(&mut child).await;
                return Err(self.base.error_of_kind(
                    ErrorKind::Transient,
                    &format!("Backend timed out after {}ms", options.timeout.as_millis()),
                ));
            }
            Finish::Killed => {
                info!(provider = %self.base.name, "Killing backend process");
                self.terminate(&mut child).await;
                return Err(self.base.error_of_kind(ErrorKind::Transient, "Backend process killed"));
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        let status = status.map_err(|e| {
            self.base
                .error_of_kind(ErrorKind::Transient, &format!("Failed to wait for backend: {}", e))
        })?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            debug!(provider = %self.base.name, code, "CliAdapter::send: non-zero exit");
            let detail = combine_streams(tail(&stdout.tail, 4_000), tail(&stderr.tail, 4_000));
            return Err(self.base.error(&format!("exit code {}: {}", code, detail)));
        }

        let completed = stdout.marker_seen;
        let total_bytes = stdout.total_bytes();
        debug!(provider = %self.base.name, completed, total_bytes, dropped = stdout.dropped, "CliAdapter::send: success");
        // rough estimate, CLIs rarely report usage
        let tokens = ((prompt.len() + total_bytes) / 4) as u64;
        let mut output = truncate_output(&self.base.redactor.redact(&stdout.tail), max);
        if stdout.dropped > 0 {
            output = format!("[{} earlier bytes not kept]\n{}", stdout.dropped, output);
        }
        Ok(BackendOutput {
            output,
            completed,
            tokens,
            cost: 0.0,
        })
    }
}
