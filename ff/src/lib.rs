//! Fixforward - fix-forward orchestration for AI coding agents
//!
//! Fixforward repeatedly asks an external agent backend to patch a workspace,
//! verifies the result with the project's own tests and lints, and feeds any
//! failures into the next prompt until the task is done or the iteration
//! bound is hit. It never rolls a patch back.
//!
//! # Core Concepts
//!
//! - **Forward Only**: Failed verification becomes the next iteration's input
//! - **Classified Errors**: Backend failures are retried, failed over or escalated by kind
//! - **Safe Points**: Pause and cancel take effect between iterations, never mid-call
//! - **Isolated Workstreams**: Parallel items each own a workspace and a session
//!
//! # Modules
//!
//! - [`provider`] - Agent backends, error classification, health and failover
//! - [`retry`] - Backoff policies and condition waits
//! - [`verify`] - Test and lint checks
//! - [`r#loop`] - The work-loop engine and its control surface
//! - [`session`] - One engine on its own task, steered through a handle
//! - [`executor`] - Bounded parallel execution of work items
//! - [`workspace`] - Git worktree and copy provisioners
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod provider;
pub mod retry;
pub mod session;
pub mod text;
pub mod verify;
pub mod workspace;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use config::{Config, StorageConfig};
pub use error::{Classified, ErrorKind};
pub use executor::{ParallelConfig, ParallelExecutor, WorkItem, WorkResult};
pub use provider::{
    AdapterConfig, CliAdapter, InvokeOptions, ManagerConfig, ManagerError, ProviderAdapter, ProviderError,
    ProviderHealth, ProviderManager, redact_secrets,
};
pub use r#loop::{LoopConfig, Phase, RunOutcome, RunStatus, SessionStatus, WorkLoopEngine};
pub use retry::{ActivityMonitor, Backoff, RetryPolicy, wait_for};
pub use session::{SessionConfig, SessionController, SessionHandle, SessionSpec, TimeoutPolicy};
pub use verify::{CommandVerifier, VerificationReport, Verifier, VerifyConfig};
pub use workspace::{WorkspaceConfig, WorkspaceProvisioner};
