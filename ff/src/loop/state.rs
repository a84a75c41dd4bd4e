//! Work-loop state, per-iteration records and the run outcome

use std::collections::{BTreeMap, VecDeque};

use checkpointstore::CheckpointStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ErrorKind;
use crate::verify::CheckKind;

/// Phase of the fix-forward state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Ready,
    ApplyPatch,
    Test,
    Diagnose,
    Done,
    Failed,
    MaxIterations,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::MaxIterations | Phase::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ready => "ready",
            Phase::ApplyPatch => "apply_patch",
            Phase::Test => "test",
            Phase::Diagnose => "diagnose",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::MaxIterations => "max_iterations",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Failed,
    MaxIterations,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::MaxIterations => "max_iterations",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            RunStatus::Done => Phase::Done,
            RunStatus::Failed => Phase::Failed,
            RunStatus::MaxIterations => Phase::MaxIterations,
            RunStatus::Cancelled => Phase::Cancelled,
        }
    }

    pub fn from_checkpoint(status: CheckpointStatus) -> Option<Self> {
        match status {
            CheckpointStatus::Running => None,
            CheckpointStatus::Done => Some(RunStatus::Done),
            CheckpointStatus::Failed => Some(RunStatus::Failed),
            CheckpointStatus::MaxIterations => Some(RunStatus::MaxIterations),
            CheckpointStatus::Cancelled => Some(RunStatus::Cancelled),
        }
    }
}

impl From<RunStatus> for CheckpointStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Done => CheckpointStatus::Done,
            RunStatus::Failed => CheckpointStatus::Failed,
            RunStatus::MaxIterations => CheckpointStatus::MaxIterations,
            RunStatus::Cancelled => CheckpointStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened in one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub failing_checks: Vec<CheckKind>,
    pub provider: Option<String>,
    /// Backend failure that ended the iteration early
    pub error: Option<String>,
}

/// Result surfaced to callers of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub iterations: u32,
    pub message: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    pub error_kind: Option<ErrorKind>,
    pub final_output: Option<String>,
}

impl RunOutcome {
    pub fn new(status: RunStatus, iterations: u32, message: impl Into<String>) -> Self {
        Self {
            status,
            iterations,
            message: message.into(),
            metrics: BTreeMap::new(),
            error_kind: None,
            final_output: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Mutable state of one work loop
///
/// Owned by the engine; the session controller reads it through
/// [`super::LoopControl`] under the same lock.
#[derive(Debug, Clone, Default)]
pub struct WorkLoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub phase: Phase,
    pub paused: bool,
    pub cancelled: bool,
    pub instructions: VecDeque<String>,
    pub records: Vec<IterationRecord>,
    pub stuck: bool,
    pub provider: Option<String>,
}

impl WorkLoopState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            ..Default::default()
        }
    }

    /// Start the next iteration; `None` once the bound is reached
    pub fn begin_iteration(&mut self) -> Option<u32> {
        if self.iteration >= self.max_iterations {
            return None;
        }
        self.iteration += 1;
        self.phase = Phase::Ready;
        Some(self.iteration)
    }

    /// Restore the counter from a checkpoint; never moves it backwards
    pub fn restore_iteration(&mut self, iteration: u32) {
        self.iteration = self.iteration.max(iteration.min(self.max_iterations));
    }

    /// Take every queued instruction, oldest first
    pub fn drain_instructions(&mut self) -> Vec<String> {
        self.instructions.drain(..).collect()
    }

    /// Put undelivered instructions back ahead of anything queued since
    pub fn requeue_instructions(&mut self, instructions: Vec<String>) {
        for text in instructions.into_iter().rev() {
            self.instructions.push_front(text);
        }
    }

    /// Aggregate metrics over the recorded iterations
    pub fn metrics(&self) -> BTreeMap<String, Value> {
        let passed = self.records.iter().filter(|r| r.passed).count();
        let failed = self.records.len() - passed;
        let total_ms: u64 = self.records.iter().map(|r| r.duration_ms).sum();
        let avg_ms = if self.records.is_empty() {
            0
        } else {
            total_ms / self.records.len() as u64
        };
        let last_failing = self
            .records
            .iter()
            .rev()
            .find(|r| !r.passed)
            .map(|r| r.failing_checks.clone())
            .unwrap_or_default();

        let mut metrics = BTreeMap::new();
        metrics.insert("iterations".to_string(), json!(self.iteration));
        metrics.insert("passed_iterations".to_string(), json!(passed));
        metrics.insert("failed_iterations".to_string(), json!(failed));
        metrics.insert("total_duration_ms".to_string(), json!(total_ms));
        metrics.insert("avg_iteration_ms".to_string(), json!(avg_ms));
        metrics.insert("last_failing_checks".to_string(), json!(last_failing));
        metrics.insert("provider".to_string(), json!(self.provider));
        metrics
    }
}
