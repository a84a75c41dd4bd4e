//! Fix-forward work loop
//!
//! - [`WorkLoopEngine`]: the per-session state machine
//! - [`LoopControl`]: pause, resume, cancel and instruction injection
//! - [`PromptBuilder`]: per-iteration prompt rendering

mod config;
mod control;
mod engine;
mod prompt;
mod state;

pub use config::{DEFAULT_COMPLETION_MARKER, LoopConfig};
pub use control::{Cancelled, LoopControl, SessionStatus};
pub use engine::{DEFAULT_BACKEND_TIMEOUT, WorkLoopEngine};
pub use prompt::{PromptBuilder, PromptContext};
pub use state::{IterationRecord, Phase, RunOutcome, RunStatus, WorkLoopState};
