//! ParallelExecutor - fan work items out to isolated sessions and fan in
//! their results
//!
//! Each item gets its own workspace and its own session. A semaphore bounds
//! how many run at once. Results come back in dispatch order, and every
//! result is appended to the result log before its workspace is destroyed.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use checkpointstore::ResultLog;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::r#loop::{RunOutcome, RunStatus};
use crate::session::{SessionController, SessionSpec, TimeoutPolicy};
use crate::workspace::{WorkspaceConfig, WorkspaceProvisioner};

/// One unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Also the session id and workspace name
    pub id: String,
    pub task: String,

    /// Selects a backend timeout from `timeouts.per-task-type`
    #[serde(rename = "task-type", default)]
    pub task_type: Option<String>,

    /// Git ref the workspace starts from
    #[serde(rename = "base-ref", default)]
    pub base_ref: Option<String>,

    #[serde(rename = "timeout-ms", default)]
    pub timeout_ms: Option<u64>,

    #[serde(rename = "max-iterations", default)]
    pub max_iterations: Option<u32>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            task_type: None,
            base_ref: None,
            timeout_ms: None,
            max_iterations: None,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }
}

/// Terminal result of one work item, as recorded in the result log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub id: String,
    pub outcome: RunOutcome,
    pub workspace: Option<PathBuf>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl WorkResult {
    fn new(id: &str, outcome: RunOutcome, workspace: Option<PathBuf>, started: Instant) -> Self {
        Self {
            id: id.to_string(),
            outcome,
            workspace,
            duration_ms: started.elapsed().as_millis() as u64,
            recorded_at: Utc::now(),
        }
    }

    fn failed(id: &str, message: String, workspace: Option<PathBuf>, started: Instant) -> Self {
        Self::new(id, RunOutcome::new(RunStatus::Failed, 0, message), workspace, started)
    }

    pub fn status(&self) -> RunStatus {
        self.outcome.status
    }
}

/// The `parallel` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Reuse recorded results instead of re-running finished items
    #[serde(rename = "resume-completed")]
    pub resume_completed: bool,

    pub workspace: WorkspaceConfig,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            resume_completed: false,
            workspace: WorkspaceConfig::default(),
        }
    }
}

/// Runs many work items, each in its own workspace and session
#[derive(Clone)]
pub struct ParallelExecutor {
    sessions: SessionController,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    timeouts: TimeoutPolicy,
    config: ParallelConfig,
    results: Option<ResultLog>,
    stop: CancellationToken,
}

impl ParallelExecutor {
    pub fn new(sessions: SessionController, provisioner: Arc<dyn WorkspaceProvisioner>, config: ParallelConfig) -> Self {
        debug!(max_concurrency = config.max_concurrency, "ParallelExecutor::new: called");
        Self {
            sessions,
            provisioner,
            timeouts: TimeoutPolicy::default(),
            config,
            results: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Record every terminal result in `results`
    pub fn with_results(mut self, results: ResultLog) -> Self {
        self.results = Some(results);
        self
    }

    /// Cancelling this token cancels every running and queued item
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run every item and return one result per item, in dispatch order
    pub async fn run_all(&self, items: Vec<WorkItem>) -> Vec<WorkResult> {
        let max_concurrency = self.config.max_concurrency.max(1);
        info!(item_count = items.len(), max_concurrency, "Dispatching work items");

        let mut recorded = self.recorded_results();
        let mut seen = HashSet::new();
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        let tasks = items.into_iter().map(|item| {
            let id = item.id.clone();
            // ids name workspaces and checkpoints, so a repeat would share both
            if !seen.insert(id.clone()) {
                warn!(id = %id, "Duplicate work item id, not running it");
                let result = WorkResult::failed(&id, format!("Duplicate work item id: {}", id), None, Instant::now());
                return (id, Dispatch::Ready(result));
            }
            if let Some(previous) = recorded.remove(&id) {
                info!(id = %id, status = %previous.status(), "Reusing recorded result");
                return (id, Dispatch::Ready(previous));
            }
            let executor = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return WorkResult::failed(&item.id, "Concurrency limiter closed".to_string(), None, started);
                };
                executor.run_item(item, started).await
            });
            (id, Dispatch::Spawned(handle))
        });
        let tasks: Vec<(String, Dispatch)> = tasks.collect();

        let results = join_all(tasks.into_iter().map(|(id, dispatch)| async move {
            match dispatch {
                Dispatch::Ready(result) => result,
                Dispatch::Spawned(handle) => match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(id = %id, error = %e, "Work item task failed");
                        WorkResult::failed(&id, format!("Work item task failed: {}", e), None, Instant::now())
                    }
                },
            }
        }))
        .await;

        let done = results.iter().filter(|r| r.status() == RunStatus::Done).count();
        info!(total = results.len(), done, "All work items finished");
        results
    }

    /// Recorded results eligible for reuse, latest per id
    fn recorded_results(&self) -> HashMap<String, WorkResult> {
        if !self.config.resume_completed {
            return HashMap::new();
        }
        let Some(log) = &self.results else {
            return HashMap::new();
        };
        match log.read_all::<WorkResult>() {
            Ok(records) => {
                let mut latest: HashMap<String, WorkResult> =
                    records.into_iter().map(|r| (r.id.clone(), r)).collect();
                // cancelled items run again
                latest.retain(|_, r| r.status() != RunStatus::Cancelled);
                latest
            }
            Err(e) => {
                warn!(error = %e, "Failed to read result log, running everything");
                HashMap::new()
            }
        }
    }

    async fn run_item(&self, item: WorkItem, started: Instant) -> WorkResult {
        debug!(id = %item.id, "ParallelExecutor::run_item: called");
        if self.stop.is_cancelled() {
            let outcome = RunOutcome::new(RunStatus::Cancelled, 0, "Cancelled before start");
            return self.record(WorkResult::new(&item.id, outcome, None, started));
        }

        let workspace = match self.provisioner.create(&item.id, item.base_ref.as_deref()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(id = %item.id, error = %e, "Failed to provision workspace");
                let result = WorkResult::failed(&item.id, format!("Failed to provision workspace: {}", e), None, started);
                return self.record(result);
            }
        };

        let timeout = self
            .timeouts
            .backend_timeout(item.task_type.as_deref(), item.timeout_ms);
        let mut spec = SessionSpec::new(&item.id, &item.task, &workspace)
            .with_backend_timeout(timeout)
            .with_resume_completed(self.config.resume_completed);
        if let Some(max_iterations) = item.max_iterations {
            spec = spec.with_max_iterations(max_iterations);
        }

        let result = match self.sessions.start(spec) {
            Ok(handle) => {
                let outcome = handle.wait_or_cancel(&self.stop).await;
                WorkResult::new(&item.id, outcome, Some(workspace.clone()), started)
            }
            Err(e) => WorkResult::failed(
                &item.id,
                format!("Failed to start session: {:#}", e),
                Some(workspace.clone()),
                started,
            ),
        };
        info!(id = %item.id, status = %result.status(), iterations = result.outcome.iterations, "Work item finished");

        let recorded = self.try_record(&result);
        if recorded {
            if let Err(e) = self.provisioner.destroy(&workspace).await {
                warn!(id = %item.id, error = %e, "Failed to clean up workspace");
            }
        } else {
            warn!(id = %item.id, workspace = %workspace.display(), "Result not recorded, keeping workspace");
        }
        result
    }

    fn record(&self, result: WorkResult) -> WorkResult {
        self.try_record(&result);
        result
    }

    /// Append to the result log; true when there is no log to write
    fn try_record(&self, result: &WorkResult) -> bool {
        let Some(log) = &self.results else {
            return true;
        };
        match log.append(result) {
            Ok(()) => true,
            Err(e) => {
                error!(id = %result.id, error = %e, "Failed to record result");
                false
            }
        }
    }
}

enum Dispatch {
    /// Settled without running: reused from the result log or rejected
    Ready(WorkResult),
    Spawned(tokio::task::JoinHandle<WorkResult>),
}
