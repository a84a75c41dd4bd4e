//! Work-loop configuration types

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::ReasoningTier;

/// Marker the backend prints once the task is done
pub const DEFAULT_COMPLETION_MARKER: &str = "TASK_COMPLETE";

const DEFAULT_STYLE_GUIDE: &str = "Keep changes minimal and consistent with the surrounding code. \
Match existing naming, formatting and error handling. Do not revert earlier fixes; build on them.";

/// Configuration for one work loop (the `engine` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Iterations before giving up with `max_iterations`
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Write a checkpoint after every Nth iteration
    #[serde(rename = "checkpoint-every")]
    pub checkpoint_every: u32,

    /// Add the style guide to every Nth prompt; 0 disables
    #[serde(rename = "style-reminder-every")]
    pub style_reminder_every: u32,

    #[serde(rename = "style-guide")]
    pub style_guide: String,

    /// Handlebars template replacing the built-in prompt
    #[serde(rename = "prompt-template")]
    pub prompt_template: Option<String>,

    /// Default completion marker for adapters without their own
    #[serde(rename = "completion-marker")]
    pub completion_marker: String,

    /// Pause between iterations
    #[serde(rename = "iteration-delay-ms")]
    pub iteration_delay_ms: u64,

    /// Reasoning tier requested from providers
    pub reasoning: Option<ReasoningTier>,
}

fn default_max_iterations() -> u32 {
    debug!("default_max_iterations: called");
    50
}

impl Default for LoopConfig {
    fn default() -> Self {
        debug!("LoopConfig::default: called");
        Self {
            max_iterations: default_max_iterations(),
            checkpoint_every: 5,
            style_reminder_every: 5,
            style_guide: DEFAULT_STYLE_GUIDE.to_string(),
            prompt_template: None,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            iteration_delay_ms: 500,
            reasoning: None,
        }
    }
}

impl LoopConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_iteration_delay_ms(mut self, delay_ms: u64) -> Self {
        self.iteration_delay_ms = delay_ms;
        self
    }

    /// Whether a checkpoint is due after `iteration`
    pub fn checkpoint_due(&self, iteration: u32) -> bool {
        self.checkpoint_every > 0 && iteration > 0 && iteration % self.checkpoint_every == 0
    }

    /// Whether the prompt for `iteration` carries the style reminder
    pub fn style_reminder_due(&self, iteration: u32) -> bool {
        self.style_reminder_every > 0
            && !self.style_guide.trim().is_empty()
            && iteration > 0
            && iteration % self.style_reminder_every == 0
    }
}
