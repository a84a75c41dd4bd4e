//! LoopControl - shared control surface between a work loop and its caller
//!
//! The engine checks pause and cancel flags only at safe points (the top of
//! each iteration), so an in-flight backend call or verification run is never
//! interrupted by pause or cooperative cancel. A kill additionally fires the
//! kill token, which terminates the backend subprocess.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::retry::ActivityMonitor;

use super::state::{Phase, WorkLoopState};

/// Returned from a safe point when the loop must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Work loop cancelled")]
pub struct Cancelled;

/// Point-in-time copy of a session's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub iteration: u32,
    pub max_iterations: u32,
    pub phase: Phase,
    pub paused: bool,
    pub cancelled: bool,
    pub pending_instructions: usize,
    pub stuck: bool,
    pub provider: Option<String>,
}

/// Monitor-guarded state plus the signals that drive pause, resume and cancel
#[derive(Debug)]
pub struct LoopControl {
    state: Mutex<WorkLoopState>,
    resume: Notify,
    cancel: CancellationToken,
    kill: CancellationToken,
    activity: ActivityMonitor,
}

impl LoopControl {
    pub fn new(max_iterations: u32) -> Self {
        debug!(max_iterations, "LoopControl::new: called");
        Self {
            state: Mutex::new(WorkLoopState::new(max_iterations)),
            resume: Notify::new(),
            cancel: CancellationToken::new(),
            kill: CancellationToken::new(),
            activity: ActivityMonitor::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkLoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the state locked; keep `f` short and never await in it
    pub fn update<R>(&self, f: impl FnOnce(&mut WorkLoopState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn set_phase(&self, phase: Phase) {
        let previous = self.update(|state| std::mem::replace(&mut state.phase, phase));
        debug!(from = %previous, to = %phase, "LoopControl::set_phase: transition");
    }

    /// Stop at the next safe point until resumed
    pub fn pause(&self) {
        self.update(|state| state.paused = true);
        info!("Session paused");
    }

    pub fn resume(&self) {
        self.update(|state| state.paused = false);
        self.resume.notify_waiters();
        info!("Session resumed");
    }

    /// Ask the loop to stop at the next safe point
    pub fn cancel(&self) {
        self.update(|state| state.cancelled = true);
        self.cancel.cancel();
        info!("Session cancel requested");
    }

    /// Cancel and terminate the in-flight backend process
    pub fn kill(&self) {
        self.cancel();
        self.kill.cancel();
        info!("Session kill requested");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue an instruction for the next prompt; returns the queue length
    pub fn inject(&self, text: impl Into<String>) -> usize {
        let text = text.into();
        let pending = self.update(|state| {
            state.instructions.push_back(text);
            state.instructions.len()
        });
        debug!(pending, "LoopControl::inject: queued instruction");
        pending
    }

    pub fn drain_instructions(&self) -> Vec<String> {
        self.update(|state| state.drain_instructions())
    }

    /// Return instructions whose prompt never reached a backend
    pub fn requeue_instructions(&self, instructions: Vec<String>) {
        if instructions.is_empty() {
            return;
        }
        let pending = self.update(|state| {
            state.requeue_instructions(instructions);
            state.instructions.len()
        });
        debug!(pending, "LoopControl::requeue_instructions: restored instructions");
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.update(|state| state.stuck = stuck);
    }

    pub fn snapshot(&self) -> SessionStatus {
        let state = self.lock();
        SessionStatus {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
            phase: state.phase,
            paused: state.paused,
            cancelled: state.cancelled,
            pending_instructions: state.instructions.len(),
            stuck: state.stuck,
            provider: state.provider.clone(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    pub fn activity(&self) -> ActivityMonitor {
        self.activity.clone()
    }

    /// Block while paused; error once cancelled
    pub async fn safe_point(&self) -> Result<(), Cancelled> {
        loop {
            // registered before the flag check so a resume in between is not lost
            let notified = self.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (paused, cancelled) = self.update(|state| (state.paused, state.cancelled));
            if cancelled {
                debug!("LoopControl::safe_point: cancelled");
                return Err(Cancelled);
            }
            if !paused {
                return Ok(());
            }

            debug!("LoopControl::safe_point: paused, waiting");
            tokio::select! {
                _ = &mut notified => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_safe_point_passes_when_running() {
        let control = LoopControl::new(5);
        assert_eq!(control.safe_point().await, Ok(()));
    }

    #[tokio::test]
    async fn test_safe_point_blocks_while_paused() {
        let control = Arc::new(LoopControl::new(5));
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.safe_point().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        control.resume();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_safe_point() {
        let control = Arc::new(LoopControl::new(5));
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.safe_point().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(result, Err(Cancelled));
        assert!(!control.kill_token().is_cancelled());
    }

    #[test]
    fn test_kill_fires_both_tokens() {
        let control = LoopControl::new(5);
        control.kill();
        assert!(control.is_cancelled());
        assert!(control.kill_token().is_cancelled());
        assert!(control.snapshot().cancelled);
    }

    #[test]
    fn test_inject_and_snapshot() {
        let control = LoopControl::new(5);
        control.pause();
        assert_eq!(control.inject("one"), 1);
        assert_eq!(control.inject("two"), 2);

        let status = control.snapshot();
        assert!(status.paused);
        assert_eq!(status.pending_instructions, 2);
        assert_eq!(status.iteration, 0);

        control.resume();
        assert_eq!(control.drain_instructions(), vec!["one", "two"]);
        assert_eq!(control.snapshot().pending_instructions, 0);
        assert_eq!(control.snapshot().iteration, 0);
    }

    #[test]
    fn test_requeued_instructions_keep_order_ahead_of_new_ones() {
        let control = LoopControl::new(5);
        control.inject("one");
        control.inject("two");
        let drained = control.drain_instructions();

        control.inject("three");
        control.requeue_instructions(drained);
        assert_eq!(control.snapshot().pending_instructions, 3);
        assert_eq!(control.drain_instructions(), vec!["one", "two", "three"]);
    }
}
