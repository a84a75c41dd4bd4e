//! In-memory checkpoints for ephemeral runs and tests

use std::sync::Mutex;

use eyre::Result;

use crate::store::{Checkpoint, CheckpointSink};

#[derive(Debug, Default)]
struct Inner {
    latest: Option<Checkpoint>,
    history: Vec<Checkpoint>,
}

/// Checkpoints of one session held in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpoints {
    inner: Mutex<Inner>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointSink for MemoryCheckpoints {
    fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).latest = Some(checkpoint.clone());
        Ok(())
    }

    fn read_latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).latest.clone())
    }

    fn append_history(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .push(checkpoint.clone());
        Ok(())
    }

    fn history(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).history.clone())
    }
}
