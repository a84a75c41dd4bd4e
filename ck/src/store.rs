//! Core CheckpointStore implementation

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::memory::MemoryCheckpoints;
use crate::{HISTORY_FILE, LATEST_FILE, RESULTS_FILE, validate_session_id};

/// Status recorded with a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Done,
    Failed,
    MaxIterations,
    Cancelled,
}

impl CheckpointStatus {
    /// Whether the session has stopped for good
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Running => "running",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::MaxIterations => "max_iterations",
            CheckpointStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of work-loop progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Session the snapshot belongs to
    pub session_id: String,
    /// Phase name at write time
    pub step_name: String,
    /// Iteration counter at write time
    pub iteration: u32,
    /// Wall-clock write time
    pub timestamp: DateTime<Utc>,
    /// Accumulated metrics
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    /// Session status
    pub status: CheckpointStatus,
}

impl Checkpoint {
    pub fn new(
        session_id: impl Into<String>,
        step_name: impl Into<String>,
        iteration: u32,
        status: CheckpointStatus,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            step_name: step_name.into(),
            iteration,
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            status,
        }
    }

    pub fn with_metrics(mut self, metrics: BTreeMap<String, serde_json::Value>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Storage contract for one session's checkpoints
///
/// Writers call `write` and `append_history` with the same snapshot; readers
/// only ever see complete snapshots.
pub trait CheckpointSink: Send + Sync {
    /// Replace the latest snapshot
    fn write(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read the latest snapshot, if any
    fn read_latest(&self) -> Result<Option<Checkpoint>>;

    /// Append a snapshot to the history
    fn append_history(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read the whole history, oldest first
    fn history(&self) -> Result<Vec<Checkpoint>>;
}

#[derive(Debug, Clone)]
enum Backing {
    Disk(PathBuf),
    Memory(Arc<Mutex<MemoryState>>),
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, Arc<MemoryCheckpoints>>,
    results: Vec<String>,
}

/// The checkpoint store: a directory of sessions plus a result log
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    backing: Backing,
}

impl CheckpointStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(base_path.join("sessions")).context("Failed to create store directory")?;
        debug!(?base_path, "Opened checkpoint store");
        Ok(Self {
            backing: Backing::Disk(base_path),
        })
    }

    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        debug!("CheckpointStore::in_memory: called");
        Self {
            backing: Backing::Memory(Arc::new(Mutex::new(MemoryState::default()))),
        }
    }

    /// Base path of a disk store
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Disk(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Checkpoints of a single session
    pub fn session(&self, session_id: &str) -> Result<Arc<dyn CheckpointSink>> {
        validate_session_id(session_id)?;
        match &self.backing {
            Backing::Disk(base) => {
                let dir = base.join("sessions").join(session_id);
                fs::create_dir_all(&dir).context(format!("Failed to create session directory {}", dir.display()))?;
                Ok(Arc::new(SessionCheckpoints { dir }))
            }
            Backing::Memory(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let sink: Arc<dyn CheckpointSink> = state
                    .sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(MemoryCheckpoints::new()))
                    .clone();
                Ok(sink)
            }
        }
    }

    /// Log of terminal results
    pub fn results(&self) -> ResultLog {
        match &self.backing {
            Backing::Disk(base) => ResultLog {
                backing: ResultBacking::Disk(base.join(RESULTS_FILE)),
            },
            Backing::Memory(state) => ResultLog {
                backing: ResultBacking::Memory(state.clone()),
            },
        }
    }

    /// List ids of all sessions that have checkpoints
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = match &self.backing {
            Backing::Disk(base) => {
                let mut sessions = Vec::new();
                for entry in fs::read_dir(base.join("sessions"))? {
                    let entry = entry?;
                    if entry.path().is_dir()
                        && let Some(name) = entry.file_name().to_str()
                    {
                        sessions.push(name.to_string());
                    }
                }
                sessions
            }
            Backing::Memory(state) => {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.sessions.keys().cloned().collect()
            }
        };
        sessions.sort();
        Ok(sessions)
    }

    /// Delete a session and all of its snapshots
    pub fn delete(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        match &self.backing {
            Backing::Disk(base) => {
                let dir = base.join("sessions").join(session_id);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                    info!(session_id, "Deleted session checkpoints");
                }
            }
            Backing::Memory(state) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.sessions.remove(session_id);
            }
        }
        Ok(())
    }
}

/// File-backed checkpoints of one session
#[derive(Debug, Clone)]
pub struct SessionCheckpoints {
    dir: PathBuf,
}

impl SessionCheckpoints {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointSink for SessionCheckpoints {
    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(session_id = %checkpoint.session_id, iteration = checkpoint.iteration, status = %checkpoint.status, "SessionCheckpoints::write: called");
        let latest = self.dir.join(LATEST_FILE);
        let tmp = self.dir.join(format!("{}.tmp", LATEST_FILE));

        let content = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = fs::File::create(&tmp).context(format!("Failed to create {}", tmp.display()))?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        // rename is atomic on the same filesystem
        fs::rename(&tmp, &latest).context(format!("Failed to replace {}", latest.display()))?;
        Ok(())
    }

    fn read_latest(&self) -> Result<Option<Checkpoint>> {
        let latest = self.dir.join(LATEST_FILE);
        if !latest.exists() {
            debug!(?latest, "SessionCheckpoints::read_latest: no snapshot");
            return Ok(None);
        }
        let content = fs::read_to_string(&latest).context(format!("Failed to read {}", latest.display()))?;
        let checkpoint = serde_json::from_str(&content).context("Failed to parse latest checkpoint")?;
        Ok(Some(checkpoint))
    }

    fn append_history(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(session_id = %checkpoint.session_id, iteration = checkpoint.iteration, "SessionCheckpoints::append_history: called");
        append_line(&self.dir.join(HISTORY_FILE), &serde_json::to_string(checkpoint)?)
    }

    fn history(&self) -> Result<Vec<Checkpoint>> {
        read_lines(&self.dir.join(HISTORY_FILE))
    }
}

#[derive(Debug, Clone)]
enum ResultBacking {
    Disk(PathBuf),
    Memory(Arc<Mutex<MemoryState>>),
}

/// Append-only log of terminal results
///
/// Records are generic so the store does not depend on the orchestrator's
/// result type.
#[derive(Debug, Clone)]
pub struct ResultLog {
    backing: ResultBacking,
}

impl ResultLog {
    /// Append a record; returns only after the record is on disk
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        match &self.backing {
            ResultBacking::Disk(path) => append_line(path, &line),
            ResultBacking::Memory(state) => {
                state.lock().unwrap_or_else(|e| e.into_inner()).results.push(line);
                Ok(())
            }
        }
    }

    /// Read every record, oldest first
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        match &self.backing {
            ResultBacking::Disk(path) => read_lines(path),
            ResultBacking::Memory(state) => {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                state
                    .results
                    .iter()
                    .map(|line| serde_json::from_str(line).context("Failed to parse result record"))
                    .collect()
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open {}", path.display()))?;

    file.lock_exclusive().context("Failed to lock file")?;
    let written = writeln!(file, "{}", line).and_then(|_| file.sync_data());
    let unlocked = FileExt::unlock(&file);
    written.context(format!("Failed to append to {}", path.display()))?;
    unlocked.context("Failed to unlock file")?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).context(format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            // a torn final line from a crash mid-append is skipped
            Err(e) => warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}
