//! SessionController - runs one work loop on its own task
//!
//! The handle returned by [`SessionController::start`] is the caller's only
//! way to steer a running session. Pause and cancel are observed at safe
//! points; cancel falls back to killing the backend and then aborting the
//! task, so it never blocks past its timeout plus a short grace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use checkpointstore::{Checkpoint, CheckpointSink, CheckpointStatus, CheckpointStore, validate_session_id};
use eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider::ProviderManager;
use crate::r#loop::{
    DEFAULT_BACKEND_TIMEOUT, LoopConfig, LoopControl, Phase, RunOutcome, RunStatus, SessionStatus, WorkLoopEngine,
};
use crate::retry::wait_for;
use crate::verify::Verifier;

/// Longest wait for a killed worker to unwind before its task is aborted
const MAX_KILL_GRACE: Duration = Duration::from_secs(1);

/// The `session` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Flag a session as stuck after this long without backend output
    #[serde(rename = "stuck-window-ms")]
    pub stuck_window_ms: u64,

    #[serde(rename = "stuck-poll-ms")]
    pub stuck_poll_ms: u64,

    /// Default wait for a cooperative cancel before forcing it
    #[serde(rename = "cancel-timeout-ms")]
    pub cancel_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stuck_window_ms: 5 * 60 * 1000,
            stuck_poll_ms: 1000,
            cancel_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// What to run in one session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub id: String,
    pub task: String,
    pub workspace: PathBuf,
    pub backend_timeout: Duration,
    /// Overrides the engine's iteration bound
    pub max_iterations: Option<u32>,
    /// Return a finished session's recorded outcome instead of rerunning it
    pub resume_completed: bool,
}

impl SessionSpec {
    pub fn new(id: impl Into<String>, task: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            workspace: workspace.into(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            max_iterations: None,
            resume_completed: false,
        }
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_resume_completed(mut self, resume_completed: bool) -> Self {
        self.resume_completed = resume_completed;
        self
    }
}

/// Starts sessions that share one provider manager and verifier
#[derive(Clone)]
pub struct SessionController {
    providers: Arc<ProviderManager>,
    verifier: Arc<dyn Verifier>,
    loop_config: LoopConfig,
    config: SessionConfig,
    store: Option<CheckpointStore>,
}

impl SessionController {
    pub fn new(providers: Arc<ProviderManager>, verifier: Arc<dyn Verifier>, loop_config: LoopConfig) -> Self {
        debug!(max_iterations = loop_config.max_iterations, "SessionController::new: called");
        Self {
            providers,
            verifier,
            loop_config,
            config: SessionConfig::default(),
            store: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Checkpoint every session into `store`
    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn store(&self) -> Option<&CheckpointStore> {
        self.store.as_ref()
    }

    /// Spawn the session's worker and its stuck watcher
    pub fn start(&self, spec: SessionSpec) -> Result<SessionHandle> {
        debug!(session_id = %spec.id, workspace = %spec.workspace.display(), "SessionController::start: called");
        validate_session_id(&spec.id)?;

        let mut loop_config = self.loop_config.clone();
        if let Some(max_iterations) = spec.max_iterations {
            loop_config.max_iterations = max_iterations;
        }
        let control = Arc::new(LoopControl::new(loop_config.max_iterations));
        let checkpoints = self.store.as_ref().map(|store| store.session(&spec.id)).transpose()?;

        let mut engine = WorkLoopEngine::new(
            spec.id.clone(),
            spec.task,
            spec.workspace,
            loop_config,
            Arc::clone(&self.providers),
            Arc::clone(&self.verifier),
        )?
        .with_control(Arc::clone(&control))
        .with_backend_timeout(spec.backend_timeout)
        .with_resume_completed(spec.resume_completed);
        if let Some(sink) = &checkpoints {
            engine = engine.with_checkpoints(Arc::clone(sink));
        }

        let worker = tokio::spawn(async move { engine.run().await });
        let watcher = tokio::spawn(watch_stuck(
            Arc::clone(&control),
            Duration::from_millis(self.config.stuck_window_ms),
            Duration::from_millis(self.config.stuck_poll_ms),
        ));

        info!(session_id = %spec.id, "Session started");
        Ok(SessionHandle {
            id: spec.id,
            control,
            worker,
            watcher,
            checkpoints,
            cancel_timeout: self.config.cancel_timeout(),
        })
    }
}

/// Caller's handle on a running session
pub struct SessionHandle {
    id: String,
    control: Arc<LoopControl>,
    worker: JoinHandle<RunOutcome>,
    watcher: JoinHandle<()>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    cancel_timeout: Duration,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pause(&self) {
        debug!(session_id = %self.id, "SessionHandle::pause: called");
        self.control.pause();
    }

    pub fn resume(&self) {
        debug!(session_id = %self.id, "SessionHandle::resume: called");
        self.control.resume();
    }

    /// Queue an instruction for the next iteration's prompt
    pub fn inject_instruction(&self, text: impl Into<String>) -> usize {
        self.control.inject(text)
    }

    pub fn status(&self) -> SessionStatus {
        self.control.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Configured wait for a cooperative cancel
    pub fn cancel_timeout(&self) -> Duration {
        self.cancel_timeout
    }

    /// Wait for the session to finish on its own
    pub async fn wait(mut self) -> RunOutcome {
        debug!(session_id = %self.id, "SessionHandle::wait: called");
        let result = (&mut self.worker).await;
        self.finish(result)
    }

    /// Wait for the session, cancelling it with the configured timeout if
    /// `stop` fires first
    pub async fn wait_or_cancel(mut self, stop: &CancellationToken) -> RunOutcome {
        debug!(session_id = %self.id, "SessionHandle::wait_or_cancel: called");
        tokio::select! {
            result = &mut self.worker => return self.finish(result),
            _ = stop.cancelled() => {}
        }
        let timeout = self.cancel_timeout;
        self.cancel(timeout).await
    }

    /// Cancel and wait at most `wait_timeout` for a safe point, then kill
    /// the backend; a worker that still does not stop is aborted and a
    /// forced cancellation is reported
    pub async fn cancel(mut self, wait_timeout: Duration) -> RunOutcome {
        info!(session_id = %self.id, timeout_ms = wait_timeout.as_millis() as u64, "Cancelling session");
        self.control.cancel();

        if let Ok(result) = tokio::time::timeout(wait_timeout, &mut self.worker).await {
            return self.finish(result);
        }

        warn!(
            session_id = %self.id,
            "Session did not reach a safe point within {}ms, killing backend",
            wait_timeout.as_millis()
        );
        self.control.kill();
        let forced = format!("Forced cancellation after {}ms", wait_timeout.as_millis());

        let grace = wait_timeout.min(MAX_KILL_GRACE);
        if let Ok(result) = tokio::time::timeout(grace, &mut self.worker).await {
            let mut outcome = self.finish(result);
            if outcome.status == RunStatus::Cancelled {
                outcome.message = forced;
            }
            return outcome;
        }

        error!(session_id = %self.id, "Session ignored kill, aborting task");
        self.worker.abort();
        self.watcher.abort();
        self.control.set_phase(Phase::Cancelled);
        self.terminal_outcome(RunStatus::Cancelled, forced)
    }

    fn finish(&self, result: Result<RunOutcome, JoinError>) -> RunOutcome {
        self.watcher.abort();
        match result {
            Ok(outcome) => {
                debug!(session_id = %self.id, status = %outcome.status, "SessionHandle::finish: worker returned");
                outcome
            }
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Session task failed");
                self.control.set_phase(Phase::Failed);
                self.terminal_outcome(RunStatus::Failed, format!("Session task failed: {}", e))
            }
        }
    }

    /// Outcome for a worker that never returned one; recorded like the
    /// engine would record it
    fn terminal_outcome(&self, status: RunStatus, message: String) -> RunOutcome {
        let (iterations, metrics) = self.control.update(|state| (state.iteration, state.metrics()));
        if let Some(sink) = &self.checkpoints {
            let checkpoint = Checkpoint::new(&self.id, status.phase().as_str(), iterations, CheckpointStatus::from(status))
                .with_metrics(metrics.clone());
            if let Err(e) = sink.write(&checkpoint).and_then(|_| sink.append_history(&checkpoint)) {
                error!(session_id = %self.id, error = %e, "Failed to write checkpoint");
            }
        }
        let mut outcome = RunOutcome::new(status, iterations, message);
        outcome.metrics = metrics;
        outcome
    }
}

/// Flag the session as stuck while a backend call shows no output for
/// `window`; clear the flag once output resumes
async fn watch_stuck(control: Arc<LoopControl>, window: Duration, poll: Duration) {
    debug!(window_ms = window.as_millis() as u64, "watch_stuck: called");
    let cancel = control.cancel_token();
    let activity = control.activity();
    let stalled = || control.update(|state| state.phase == Phase::ApplyPatch) && activity.is_idle(window);

    loop {
        if control.update(|state| state.phase.is_terminal()) {
            break;
        }
        let became_stuck = tokio::select! {
            _ = cancel.cancelled() => break,
            stuck = wait_for(&stalled, window, poll) => stuck,
        };
        if !became_stuck {
            continue;
        }

        control.set_stuck(true);
        warn!(idle_ms = activity.idle_for().as_millis() as u64, "Session looks stuck, no backend output");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                cleared = wait_for(|| !stalled(), window, poll) => if cleared { break },
            }
        }
        control.set_stuck(false);
        info!("Session activity resumed");
    }
    debug!("watch_stuck: done");
}
