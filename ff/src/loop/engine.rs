//! WorkLoopEngine - the fix-forward iteration state machine
//!
//! Each iteration: build a prompt, ask a provider to apply a patch, verify the
//! workspace, then either finish or feed the failures into the next prompt.
//! The engine never rolls back a patch; it only moves forward or gives up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use checkpointstore::{Checkpoint, CheckpointSink, CheckpointStatus};
use tracing::{debug, error, info, warn};

use crate::provider::{InvokeOptions, ManagerError, PatchResult, ProviderManager, redact_secrets};
use crate::verify::{VerificationReport, Verifier};

use super::config::LoopConfig;
use super::control::LoopControl;
use super::prompt::{PromptBuilder, PromptContext};
use super::state::{IterationRecord, Phase, RunOutcome, RunStatus};

/// Default start-to-close timeout for one backend call
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How an iteration ended when it did not end the run
enum Step {
    Continue,
    Finished(RunOutcome),
}

/// Work-loop engine for one unit of work
pub struct WorkLoopEngine {
    session_id: String,
    task: String,
    workspace: PathBuf,
    config: LoopConfig,
    providers: Arc<ProviderManager>,
    verifier: Arc<dyn Verifier>,
    control: Arc<LoopControl>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    prompts: PromptBuilder,
    backend_timeout: Duration,
    /// Return the recorded outcome of a finished session instead of rerunning it
    resume_completed: bool,
    /// Failing check output carried into the next prompt
    diagnostics: Option<String>,
}

impl WorkLoopEngine {
    /// Create an engine; fails only when the prompt template is invalid
    pub fn new(
        session_id: impl Into<String>,
        task: impl Into<String>,
        workspace: impl Into<PathBuf>,
        config: LoopConfig,
        providers: Arc<ProviderManager>,
        verifier: Arc<dyn Verifier>,
    ) -> eyre::Result<Self> {
        let session_id = session_id.into();
        debug!(%session_id, max_iterations = config.max_iterations, "WorkLoopEngine::new: called");
        let prompts = PromptBuilder::new(config.prompt_template.as_deref())?;
        let control = Arc::new(LoopControl::new(config.max_iterations));
        Ok(Self {
            session_id,
            task: task.into(),
            workspace: workspace.into(),
            config,
            providers,
            verifier,
            control,
            checkpoints: None,
            prompts,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            resume_completed: false,
            diagnostics: None,
        })
    }

    /// Share control with a session controller
    pub fn with_control(mut self, control: Arc<LoopControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_resume_completed(mut self, resume_completed: bool) -> Self {
        self.resume_completed = resume_completed;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn control(&self) -> Arc<LoopControl> {
        Arc::clone(&self.control)
    }

    /// Run until done, failed, cancelled or out of iterations
    pub async fn run(&mut self) -> RunOutcome {
        info!(
            session_id = %self.session_id,
            max_iterations = self.config.max_iterations,
            workspace = %self.workspace.display(),
            "Starting work loop"
        );

        if let Some(outcome) = self.resume_from_checkpoint() {
            return outcome;
        }

        loop {
            if self.control.safe_point().await.is_err() {
                return self.finish(RunStatus::Cancelled, "Cancelled by caller".to_string(), None, None);
            }

            let Some(iteration) = self.control.update(|state| state.begin_iteration()) else {
                let message = format!("Gave up after {} iterations", self.config.max_iterations);
                warn!(session_id = %self.session_id, "{}", message);
                return self.finish(RunStatus::MaxIterations, message, None, None);
            };
            info!(
                session_id = %self.session_id,
                "Iteration {}/{}", iteration, self.config.max_iterations
            );

            match self.run_iteration(iteration).await {
                Step::Finished(outcome) => return outcome,
                Step::Continue => {}
            }

            if self.config.checkpoint_due(iteration) {
                self.checkpoint(CheckpointStatus::Running);
            }

            if self.config.iteration_delay_ms > 0 {
                let delay = Duration::from_millis(self.config.iteration_delay_ms);
                let cancel = self.control.cancel_token();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Pick up from the latest checkpoint
    ///
    /// Running and cancelled sessions continue from their iteration. A
    /// finished session returns its recorded outcome only when completed
    /// sessions are reused; otherwise it starts over.
    fn resume_from_checkpoint(&self) -> Option<RunOutcome> {
        let sink = self.checkpoints.as_ref()?;
        let latest = match sink.read_latest() {
            Ok(latest) => latest?,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Failed to read checkpoint, starting fresh");
                return None;
            }
        };

        if let Some(status) = RunStatus::from_checkpoint(latest.status)
            && status != RunStatus::Cancelled
        {
            if !self.resume_completed {
                info!(session_id = %self.session_id, %status, "Previous run finished, starting over");
                return None;
            }
            info!(session_id = %self.session_id, %status, "Session already finished");
            let mut outcome = RunOutcome::new(
                status,
                latest.iteration,
                format!("Already finished with status {} at iteration {}", status, latest.iteration),
            );
            outcome.metrics = latest.metrics;
            self.control.set_phase(status.phase());
            return Some(outcome);
        }

        info!(session_id = %self.session_id, iteration = latest.iteration, "Resuming from checkpoint");
        self.control.update(|state| state.restore_iteration(latest.iteration));
        None
    }

    async fn run_iteration(&mut self, iteration: u32) -> Step {
        debug!(session_id = %self.session_id, iteration, "WorkLoopEngine::run_iteration: called");
        let started = Instant::now();

        // READY -> APPLY_PATCH
        let instructions = self.control.drain_instructions();
        let style = self
            .config
            .style_reminder_due(iteration)
            .then_some(self.config.style_guide.as_str());
        let context = PromptContext {
            task: &self.task,
            iteration,
            max_iterations: self.config.max_iterations,
            instructions: &instructions,
            diagnostics: self.diagnostics.as_deref(),
            style_reminder: style,
            completion_marker: &self.config.completion_marker,
        };
        let prompt = match self.prompts.render(&context) {
            Ok(prompt) => prompt,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "Failed to build prompt");
                return Step::Finished(self.finish(RunStatus::Failed, format!("Failed to build prompt: {:#}", e), None, None));
            }
        };

        self.control.set_phase(Phase::ApplyPatch);
        // idle time is measured from the start of the call
        self.control.activity().touch();
        let mut options = InvokeOptions::new(&self.workspace, self.backend_timeout)
            .with_kill(self.control.kill_token())
            .with_activity(self.control.activity());
        if let Some(tier) = self.config.reasoning {
            options = options.with_reasoning(tier);
        }

        let patch = match self.providers.apply_patch(&prompt, &options).await {
            Ok(patch) => patch,
            Err(e) => return self.on_backend_error(iteration, started, e, instructions),
        };
        self.control.update(|state| state.provider = Some(patch.provider.clone()));

        // APPLY_PATCH -> TEST
        self.control.set_phase(Phase::Test);
        let report = self.verifier.verify(&self.workspace).await;
        self.record(iteration, started, &patch, &report);

        if report.all_passed() && patch.completed {
            self.control.set_phase(Phase::Done);
            self.diagnostics = None;
            let message = format!("Task complete after {} iteration(s)", iteration);
            info!(session_id = %self.session_id, iteration, "Task complete");
            return Step::Finished(self.finish(RunStatus::Done, message, None, Some(patch.output)));
        }

        if report.all_passed() {
            debug!(iteration, "WorkLoopEngine::run_iteration: checks pass, completion not signalled");
            self.diagnostics = None;
        } else {
            self.control.set_phase(Phase::Diagnose);
            let failing = report.failing_output();
            info!(session_id = %self.session_id, iteration, failing = ?report.failing_kinds(), "Verification failed");
            self.diagnostics = Some(redact_secrets(&failing));
        }
        self.control.set_phase(Phase::Ready);
        Step::Continue
    }

    fn on_backend_error(&mut self, iteration: u32, started: Instant, err: ManagerError, instructions: Vec<String>) -> Step {
        let message = err.to_string();
        self.control.update(|state| {
            state.records.push(IterationRecord {
                iteration,
                passed: false,
                duration_ms: started.elapsed().as_millis() as u64,
                failing_checks: Vec::new(),
                provider: None,
                error: Some(message.clone()),
            })
        });

        match err {
            ManagerError::Cancelled => {
                info!(session_id = %self.session_id, iteration, "Backend call cancelled");
                Step::Finished(self.finish(RunStatus::Cancelled, "Cancelled by caller".to_string(), None, None))
            }
            err if err.is_fatal() => {
                error!(session_id = %self.session_id, iteration, error = %err, "Backend failure is fatal");
                let kind = err.kind();
                Step::Finished(self.finish(RunStatus::Failed, message, kind, None))
            }
            err => {
                // retries were exhausted; the next iteration tries again
                warn!(session_id = %self.session_id, iteration, error = %err, "Backend call failed, moving on");
                self.control.requeue_instructions(instructions);
                self.diagnostics = Some(format!("The previous attempt failed before verification: {}", message));
                self.control.set_phase(Phase::Ready);
                Step::Continue
            }
        }
    }

    fn record(&self, iteration: u32, started: Instant, patch: &PatchResult, report: &VerificationReport) {
        let record = IterationRecord {
            iteration,
            passed: report.all_passed(),
            duration_ms: started.elapsed().as_millis() as u64,
            failing_checks: report.failing_kinds(),
            provider: Some(patch.provider.clone()),
            error: None,
        };
        debug!(?record, "WorkLoopEngine::record: called");
        self.control.update(|state| state.records.push(record));
    }

    fn checkpoint(&self, status: CheckpointStatus) {
        let Some(sink) = &self.checkpoints else {
            return;
        };
        let (phase, iteration, metrics) = self
            .control
            .update(|state| (state.phase, state.iteration, state.metrics()));
        let checkpoint = Checkpoint::new(&self.session_id, phase.as_str(), iteration, status).with_metrics(metrics);
        debug!(session_id = %self.session_id, iteration, %status, "WorkLoopEngine::checkpoint: writing");

        if let Err(e) = sink.write(&checkpoint).and_then(|_| sink.append_history(&checkpoint)) {
            error!(session_id = %self.session_id, error = %e, "Failed to write checkpoint");
        }
    }

    fn finish(
        &self,
        status: RunStatus,
        message: String,
        error_kind: Option<crate::error::ErrorKind>,
        final_output: Option<String>,
    ) -> RunOutcome {
        self.control.set_phase(status.phase());
        self.checkpoint(status.into());

        let (iterations, metrics) = self.control.update(|state| (state.iteration, state.metrics()));
        info!(session_id = %self.session_id, %status, iterations, "Work loop finished");
        RunOutcome {
            status,
            iterations,
            message: redact_secrets(&message),
            metrics,
            error_kind,
            final_output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::mock::{ScriptedAdapter, Step as Script};
    use crate::provider::{ManagerConfig, ProviderAdapter};
    use crate::retry::RetryPolicy;
    use crate::verify::{CheckKind, CheckResult};
    use async_trait::async_trait;
    use checkpointstore::MemoryCheckpoints;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Verifier that fails its first `failures` runs
    struct CountingVerifier {
        failures: u32,
        runs: AtomicU32,
    }

    impl CountingVerifier {
        fn passing() -> Arc<Self> {
            Self::failing_first(0)
        }

        fn failing_first(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                runs: AtomicU32::new(0),
            })
        }

        fn always_failing() -> Arc<Self> {
            Self::failing_first(u32::MAX)
        }
    }

    #[async_trait]
    impl Verifier for CountingVerifier {
        async fn verify(&self, _workspace: &Path) -> VerificationReport {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                VerificationReport::new(vec![
                    CheckResult::failed(CheckKind::Test, 1, format!("test_parse failed on run {}", run + 1)),
                    CheckResult::passed(CheckKind::Lint, ""),
                ])
            } else {
                VerificationReport::new(vec![CheckResult::passed(CheckKind::Test, "ok")])
            }
        }
    }

    fn providers(adapter: Arc<ScriptedAdapter>) -> Arc<ProviderManager> {
        let config = ManagerConfig {
            retry: RetryPolicy::constant(Duration::from_millis(1)).with_max_attempts(2),
            ..Default::default()
        };
        Arc::new(ProviderManager::new(vec![adapter as Arc<dyn ProviderAdapter>], config))
    }

    fn config(max_iterations: u32) -> LoopConfig {
        LoopConfig::default()
            .with_max_iterations(max_iterations)
            .with_iteration_delay_ms(0)
    }

    fn engine(adapter: Arc<ScriptedAdapter>, verifier: Arc<dyn Verifier>, max_iterations: u32) -> WorkLoopEngine {
        WorkLoopEngine::new("s1", "fix the bug", "/tmp", config(max_iterations), providers(adapter), verifier).unwrap()
    }

    #[tokio::test]
    async fn test_done_on_first_iteration() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("all fixed")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 50);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.final_output.as_deref(), Some("all fixed"));
        assert_eq!(adapter.calls(), 1);
        assert_eq!(engine.control().snapshot().phase, Phase::Done);
    }

    #[tokio::test]
    async fn test_always_failing_verification_hits_max_iterations() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("claims done")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::always_failing(), 7);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.iterations, 7);
        assert_eq!(adapter.calls(), 7);
        assert_eq!(outcome.metrics["failed_iterations"], serde_json::json!(7));
    }

    #[tokio::test]
    async fn test_passing_checks_without_completion_keeps_going() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "a",
            vec![Script::progress("step 1"), Script::progress("step 2"), Script::done("done")],
        ));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 10);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_diagnostics_feed_next_prompt() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("done")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::failing_first(1), 10);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 2);

        let prompts = adapter.prompts();
        assert!(!prompts[0].contains("test_parse failed"));
        assert!(prompts[1].contains("test_parse failed on run 1"));
        assert!(prompts[1].contains("## test failed (exit code 1)"));
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::fail("invalid request: bad model")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 50);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Permanent));
        assert!(outcome.message.contains("bad model"));
    }

    #[tokio::test]
    async fn test_auth_expired_without_fallback_fails() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::fail("401 Unauthorized")]));
        let mut engine = engine(adapter, CountingVerifier::passing(), 50);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::AuthExpired));
    }

    #[tokio::test]
    async fn test_exhausted_transient_moves_to_next_iteration() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "a",
            vec![Script::fail("connection reset"), Script::fail("connection reset"), Script::done("ok")],
        ));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 10);

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(adapter.calls(), 3);
        assert!(adapter.prompts()[2].contains("failed before verification"));
    }

    #[tokio::test]
    async fn test_style_reminder_every_fifth_iteration() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::progress("working")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 6);

        engine.run().await;
        let prompts = adapter.prompts();
        assert_eq!(prompts.len(), 6);
        for (index, prompt) in prompts.iter().enumerate() {
            let iteration = index + 1;
            assert_eq!(prompt.contains("Style reminder"), iteration == 5, "iteration {}", iteration);
        }
    }

    #[tokio::test]
    async fn test_checkpoints_on_cadence_and_terminal() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::progress("working")]));
        let sink = Arc::new(MemoryCheckpoints::new());
        let mut engine = engine(adapter, CountingVerifier::always_failing(), 12).with_checkpoints(sink.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);

        let history = sink.history().unwrap();
        let iterations: Vec<u32> = history.iter().map(|c| c.iteration).collect();
        assert_eq!(iterations, vec![5, 10, 12]);
        assert!(history.iter().all(|c| c.iteration <= 12));
        assert_eq!(history[0].status, CheckpointStatus::Running);

        let latest = sink.read_latest().unwrap().unwrap();
        assert_eq!(latest.status, CheckpointStatus::MaxIterations);
        assert_eq!(latest.step_name, "max_iterations");
    }

    #[tokio::test]
    async fn test_resume_from_running_checkpoint() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::progress("working")]));
        let sink = Arc::new(MemoryCheckpoints::new());
        sink.write(&Checkpoint::new("s1", "ready", 5, CheckpointStatus::Running)).unwrap();

        let mut engine = engine(adapter.clone(), CountingVerifier::always_failing(), 8).with_checkpoints(sink);
        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::MaxIterations);
        assert_eq!(outcome.iterations, 8);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn test_terminal_checkpoint_returns_recorded_outcome() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("never")]));
        let sink = Arc::new(MemoryCheckpoints::new());
        sink.write(&Checkpoint::new("s1", "done", 3, CheckpointStatus::Done)).unwrap();

        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 8)
            .with_checkpoints(sink)
            .with_resume_completed(true);
        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_checkpoint_reruns_without_resume_completed() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("fixed again")]));
        let sink = Arc::new(MemoryCheckpoints::new());
        sink.write(&Checkpoint::new("s1", "failed", 3, CheckpointStatus::Failed)).unwrap();

        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 8).with_checkpoints(sink.clone());
        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(adapter.calls(), 1);
        assert_eq!(sink.read_latest().unwrap().unwrap().status, CheckpointStatus::Done);
    }

    #[tokio::test]
    async fn test_cancelled_checkpoint_resumes_its_iteration() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("done")]));
        let sink = Arc::new(MemoryCheckpoints::new());
        sink.write(&Checkpoint::new("s1", "cancelled", 2, CheckpointStatus::Cancelled)).unwrap();

        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 8)
            .with_checkpoints(sink)
            .with_resume_completed(true);
        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_instructions_survive_failed_backend_call() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "a",
            vec![
                Script::fail("connection reset"),
                Script::fail("connection reset"),
                Script::progress("step"),
                Script::done("done"),
            ],
        ));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 10);
        engine.control().inject("use the new API");

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Done);
        assert_eq!(outcome.iterations, 3);

        let with_instruction: Vec<usize> = adapter
            .prompts()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.contains("- use the new API"))
            .map(|(i, _)| i)
            .collect();
        // both attempts of iteration 1, then iteration 2 once it got through
        assert_eq!(with_instruction, vec![0, 1, 2]);
        assert_eq!(engine.control().snapshot().pending_instructions, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::done("x")]));
        let mut engine = engine(adapter.clone(), CountingVerifier::passing(), 5);
        engine.control().cancel();

        let outcome = engine.run().await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_kill_during_backend_call() {
        let adapter = Arc::new(ScriptedAdapter::new("a", vec![Script::Hang]));
        let mut engine = engine(adapter, CountingVerifier::passing(), 5);
        let control = engine.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            control.kill();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), engine.run()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_secrets_redacted_from_message() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "a",
            vec![Script::fail("invalid request for key sk-abcdefghijklmnop1234")],
        ));
        let mut engine = engine(adapter, CountingVerifier::passing(), 5);

        let outcome = engine.run().await;
        assert!(!outcome.message.contains("abcdefghijklmnop1234"));
    }
}
