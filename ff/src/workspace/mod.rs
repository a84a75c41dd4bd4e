//! Isolated workspaces for parallel work items
//!
//! Every work item gets its own directory, either a git worktree on a
//! dedicated branch or a plain copy of a source tree. A provisioner never
//! hands out an id or path that is still live.

mod manager;

use std::sync::Arc;

pub use manager::{
    CopyProvisioner, GitWorktreeProvisioner, WorkspaceConfig, WorkspaceError, WorkspaceKind, WorkspaceProvisioner,
};

/// Provisioner for the configured workspace kind
pub fn provisioner(config: &WorkspaceConfig) -> Arc<dyn WorkspaceProvisioner> {
    match config.kind {
        WorkspaceKind::Git => Arc::new(GitWorktreeProvisioner::new(config.clone())),
        WorkspaceKind::Copy => Arc::new(CopyProvisioner::new(config.clone())),
    }
}
