//! CheckpointStore - durable progress snapshots for fix-forward sessions
//!
//! Every session writes an immutable snapshot of its progress at a fixed
//! cadence and on terminal transitions. The latest snapshot is kept next to
//! an append-only history, and terminal results of parallel runs are kept in
//! a single result log so they survive workspace cleanup.
//!
//! # Architecture
//!
//! ```text
//! {state_dir}/
//! ├── sessions/
//! │   └── {session_id}/
//! │       ├── latest.json      # most recent snapshot (atomically replaced)
//! │       └── history.jsonl    # every snapshot, append-only
//! └── results.jsonl            # terminal results, append-only
//! ```
//!
//! # Example
//!
//! ```ignore
//! use checkpointstore::{Checkpoint, CheckpointStatus, CheckpointStore};
//!
//! let store = CheckpointStore::open(".fixforward")?;
//! let sink = store.session("fix-login")?;
//! let snapshot = Checkpoint::new("fix-login", "TEST", 5, CheckpointStatus::Running);
//! sink.write(&snapshot)?;
//! sink.append_history(&snapshot)?;
//! ```

pub mod cli;
pub mod config;
mod memory;
mod store;

pub use memory::MemoryCheckpoints;
pub use store::{Checkpoint, CheckpointSink, CheckpointStatus, CheckpointStore, ResultLog, SessionCheckpoints};

/// File holding the most recent snapshot of a session
pub const LATEST_FILE: &str = "latest.json";

/// File holding every snapshot of a session
pub const HISTORY_FILE: &str = "history.jsonl";

/// File holding terminal results of parallel runs
pub const RESULTS_FILE: &str = "results.jsonl";

/// Validate a session id before it is used as a directory name
pub fn validate_session_id(session_id: &str) -> eyre::Result<()> {
    let valid = !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(eyre::eyre!("Invalid session id: {:?}", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("fix-login_2.v1").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("has space").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_ids_are_accepted(id in "[A-Za-z0-9_-][A-Za-z0-9_.-]{0,40}") {
            prop_assert!(validate_session_id(&id).is_ok());
        }

        #[test]
        fn prop_path_separators_are_rejected(head in "[a-z]{1,8}", tail in "[a-z]{1,8}") {
            let slash = format!("{}/{}", head, tail);
            let backslash = format!("{}\\{}", head, tail);
            prop_assert!(validate_session_id(&slash).is_err());
            prop_assert!(validate_session_id(&backslash).is_err());
        }
    }
}
