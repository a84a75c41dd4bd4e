//! Store settings, read from the `storage` section of the fixforward config
//!
//! `ck` and `ff` share one config file, so both binaries agree on where
//! checkpoints live.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Project-local config file shared with `ff`
pub const LOCAL_CONFIG_FILE: &str = ".fixforward.yml";

/// The `storage` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Checkpoint store directory
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Newest history entries `ck history` shows; 0 shows all
    #[serde(rename = "history-limit")]
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_store_path(),
            history_limit: 20,
        }
    }
}

/// Default store location
pub fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fixforward")
        .join("state")
}

/// Only the section this crate owns; the rest of the file belongs to `ff`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    storage: StoreConfig,
}

impl StoreConfig {
    /// Load the `storage` section from `path`, or from the first config
    /// file found, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let candidates = [
            Some(PathBuf::from(LOCAL_CONFIG_FILE)),
            dirs::config_dir().map(|p| p.join("fixforward").join("fixforward.yml")),
        ];
        match candidates.into_iter().flatten().find(|p| p.exists()) {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("StoreConfig::load: no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Keep the newest `history_limit` entries of `history`
    pub fn limit_history<T>(&self, mut history: Vec<T>) -> Vec<T> {
        if self.history_limit > 0 && history.len() > self.history_limit {
            history.drain(..history.len() - self.history_limit);
        }
        history
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&content).context(format!("Failed to parse {}", path.display()))?;
        debug!(path = %path.display(), state_dir = %file.storage.state_dir.display(), "StoreConfig::load_from_file: loaded");
        Ok(file.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_storage_section_of_shared_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ff.yml");
        let yaml = r#"
engine:
  max-iterations: 3
storage:
  state-dir: /var/lib/ff
  history-limit: 5
"#;
        std::fs::write(&path, yaml).unwrap();

        let config = StoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/ff"));
        assert_eq!(config.history_limit, 5);
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ff.yml");
        std::fs::write(&path, "log-level: debug\n").unwrap();

        let config = StoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.state_dir, default_store_path());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        assert!(StoreConfig::load(Some(Path::new("/nonexistent/ff.yml"))).is_err());
    }

    #[test]
    fn test_limit_history_keeps_newest() {
        let config = StoreConfig {
            history_limit: 2,
            ..Default::default()
        };
        assert_eq!(config.limit_history(vec![1, 2, 3, 4]), vec![3, 4]);
        assert_eq!(config.limit_history(vec![1]), vec![1]);

        let unlimited = StoreConfig {
            history_limit: 0,
            ..Default::default()
        };
        assert_eq!(unlimited.limit_history(vec![1, 2, 3]), vec![1, 2, 3]);
    }
}
