//! Workspace provisioners: git worktrees and plain directory copies

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for workspace operations
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace: {0}")]
    CreateFailed(String),

    #[error("Failed to remove workspace: {0}")]
    RemoveFailed(String),

    #[error("Workspace already in use: {0}")]
    InUse(String),

    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Disk space error: {0}")]
    DiskSpace(String),

    #[error("Git command failed: {0}")]
    GitError(String),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates and destroys isolated working directories
///
/// A path returned by `create` belongs to the caller alone until `destroy`.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn create(&self, id: &str, base_ref: Option<&str>) -> Result<PathBuf, WorkspaceError>;
    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    #[default]
    Git,
    Copy,
}

/// Configuration for workspace provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub kind: WorkspaceKind,

    /// Directory holding one workspace per work item
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,

    /// Repository (git) or tree (copy) workspaces are made from
    pub source: PathBuf,

    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Refuse to create git worktrees below this much free space; 0 disables
    #[serde(rename = "min-disk-space-gb")]
    pub min_disk_space_gb: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            kind: WorkspaceKind::Git,
            base_dir: std::env::temp_dir().join("fixforward").join("workspaces"),
            source: PathBuf::from("."),
            branch_prefix: "fixforward".to_string(),
            min_disk_space_gb: 1,
        }
    }
}

/// Ids and paths currently handed out
#[derive(Debug, Default)]
struct LiveSet {
    paths: Mutex<HashMap<PathBuf, String>>,
}

impl LiveSet {
    fn claim(&self, id: &str, path: &Path) -> Result<(), WorkspaceError> {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if paths.contains_key(path) || paths.values().any(|live| live == id) {
            debug!(%id, "LiveSet::claim: already live");
            return Err(WorkspaceError::InUse(id.to_string()));
        }
        paths.insert(path.to_path_buf(), id.to_string());
        Ok(())
    }

    fn id_of(&self, path: &Path) -> Option<String> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).get(path).cloned()
    }

    fn release(&self, path: &Path) {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
    }

    fn len(&self) -> usize {
        self.paths.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn validate_id(id: &str) -> Result<(), WorkspaceError> {
    checkpointstore::validate_session_id(id).map_err(|e| WorkspaceError::CreateFailed(e.to_string()))
}

async fn git(args: &[&str], dir: &Path) -> Result<std::process::Output, WorkspaceError> {
    debug!(?args, dir = %dir.display(), "git: called");
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| WorkspaceError::GitError(e.to_string()))
}

/// One git worktree per work item, on its own branch
pub struct GitWorktreeProvisioner {
    config: WorkspaceConfig,
    live: LiveSet,
}

impl GitWorktreeProvisioner {
    pub fn new(config: WorkspaceConfig) -> Self {
        debug!(?config, "GitWorktreeProvisioner::new: called");
        Self {
            config,
            live: LiveSet::default(),
        }
    }

    pub fn branch_name(&self, id: &str) -> String {
        format!("{}/{}", self.config.branch_prefix, id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    async fn ensure_disk_space(&self) -> Result<(), WorkspaceError> {
        if self.config.min_disk_space_gb == 0 {
            debug!("GitWorktreeProvisioner::ensure_disk_space: check disabled");
            return Ok(());
        }
        let available_gb = self.check_disk_space().await?;
        if available_gb < self.config.min_disk_space_gb {
            return Err(WorkspaceError::DiskSpace(format!(
                "Only {}GB available, need {}GB minimum",
                available_gb, self.config.min_disk_space_gb
            )));
        }
        debug!(available_gb, "GitWorktreeProvisioner::ensure_disk_space: sufficient disk space");
        Ok(())
    }

    /// Available space in GB on the base directory's filesystem
    async fn check_disk_space(&self) -> Result<u64, WorkspaceError> {
        let output = Command::new("df")
            .arg("-BG")
            .arg(&self.config.base_dir)
            .output()
            .await
            .map_err(|e| WorkspaceError::DiskSpace(format!("Failed to check disk space: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        // "Filesystem 1G-blocks Used Available Use% Mounted on", values on line 2
        for line in stdout.lines().skip(1) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 4
                && let Ok(gb) = parts[3].trim_end_matches('G').parse::<u64>()
            {
                return Ok(gb);
            }
        }
        debug!("GitWorktreeProvisioner::check_disk_space: unparseable df output");
        Ok(u64::MAX)
    }

    async fn remove_worktree(&self, path: &Path, id: &str) -> Result<(), WorkspaceError> {
        let path_arg = path.to_string_lossy();
        let output = git(&["worktree", "remove", &path_arg, "--force"], &self.config.source).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                return Err(WorkspaceError::RemoveFailed(stderr.trim().to_string()));
            }
            debug!("GitWorktreeProvisioner::remove_worktree: not a worktree, removing directory");
            if path.exists() {
                tokio::fs::remove_dir_all(path).await?;
            }
        }
        let branch = self.branch_name(id);
        let _ = git(&["branch", "-D", &branch], &self.config.source).await;
        let _ = git(&["worktree", "prune"], &self.config.source).await;
        Ok(())
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktreeProvisioner {
    async fn create(&self, id: &str, base_ref: Option<&str>) -> Result<PathBuf, WorkspaceError> {
        debug!(%id, ?base_ref, "GitWorktreeProvisioner::create: called");
        validate_id(id)?;
        let path = self.config.base_dir.join(id);
        self.live.claim(id, &path)?;

        let result: Result<PathBuf, WorkspaceError> = async {
            tokio::fs::create_dir_all(&self.config.base_dir)
                .await
                .map_err(|e| WorkspaceError::CreateFailed(format!("Failed to create base dir: {}", e)))?;
            self.ensure_disk_space().await?;

            if path.exists() {
                warn!(path = %path.display(), "Removing stale workspace");
                self.remove_worktree(&path, id).await?;
            }

            let branch = self.branch_name(id);
            let path_arg = path.to_string_lossy();
            let output = git(
                &["worktree", "add", &path_arg, "-B", &branch, base_ref.unwrap_or("HEAD")],
                &self.config.source,
            )
            .await?;
            if !output.status.success() {
                return Err(WorkspaceError::CreateFailed(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            info!(path = %path.display(), %branch, "Created worktree");
            Ok(path.clone())
        }
        .await;

        if result.is_err() {
            self.live.release(&path);
        }
        result
    }

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        debug!(path = %path.display(), "GitWorktreeProvisioner::destroy: called");
        let id = self
            .live
            .id_of(path)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .ok_or_else(|| WorkspaceError::NotFound(path.display().to_string()))?;

        if !path.exists() {
            warn!(path = %path.display(), "Worktree does not exist, skipping removal");
            self.live.release(path);
            return Ok(());
        }

        let result = self.remove_worktree(path, &id).await;
        if result.is_ok() {
            info!(%id, "Removed worktree");
            self.live.release(path);
        }
        result
    }
}

/// Plain recursive copy of a source tree per work item
pub struct CopyProvisioner {
    config: WorkspaceConfig,
    live: LiveSet,
}

impl CopyProvisioner {
    pub fn new(config: WorkspaceConfig) -> Self {
        debug!(?config, "CopyProvisioner::new: called");
        Self {
            config,
            live: LiveSet::default(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<u64, WorkspaceError> {
    let mut copied = 0;
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl WorkspaceProvisioner for CopyProvisioner {
    async fn create(&self, id: &str, _base_ref: Option<&str>) -> Result<PathBuf, WorkspaceError> {
        debug!(%id, "CopyProvisioner::create: called");
        validate_id(id)?;
        let path = self.config.base_dir.join(id);
        self.live.claim(id, &path)?;

        let source = self.config.source.clone();
        let dest = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            copy_tree(&source, &dest)
        })
        .await
        .map_err(|e| WorkspaceError::CreateFailed(e.to_string()))
        .and_then(|r| r);

        match result {
            Ok(files) => {
                info!(path = %path.display(), files, "Created workspace copy");
                Ok(path)
            }
            Err(e) => {
                self.live.release(&path);
                Err(e)
            }
        }
    }

    async fn destroy(&self, path: &Path) -> Result<(), WorkspaceError> {
        debug!(path = %path.display(), "CopyProvisioner::destroy: called");
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| WorkspaceError::RemoveFailed(e.to_string()))?;
        } else {
            warn!(path = %path.display(), "Workspace does not exist, skipping removal");
        }
        self.live.release(path);
        Ok(())
    }
}
