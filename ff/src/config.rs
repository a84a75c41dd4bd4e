//! Fixforward configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::ParallelConfig;
use crate::provider::ManagerConfig;
use crate::r#loop::LoopConfig;
use crate::session::{SessionConfig, TimeoutPolicy};
use crate::verify::VerifyConfig;

/// Storage configuration, shared with the `ck` binary
pub use checkpointstore::config::StoreConfig as StorageConfig;

/// Project-local config file, checked before the user config
pub const LOCAL_CONFIG_FILE: &str = ".fixforward.yml";

/// Main fixforward configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing filter used when RUST_LOG is not set
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Work-loop settings
    pub engine: LoopConfig,

    /// Provider adapters and routing
    pub providers: ManagerConfig,

    /// Test and lint commands
    pub verification: VerifyConfig,

    /// Backend call timeouts
    pub timeouts: TimeoutPolicy,

    /// Stuck detection and cancellation
    pub session: SessionConfig,

    /// Parallel execution and workspaces
    pub parallel: ParallelConfig,

    /// Checkpoints and results
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            engine: LoopConfig::default(),
            providers: ManagerConfig::default(),
            verification: VerifyConfig::default(),
            timeouts: TimeoutPolicy::default(),
            session: SessionConfig::default(),
            parallel: ParallelConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Only the log level, read before logging is set up
#[derive(Debug, Deserialize)]
struct LogLevelOnly {
    #[serde(rename = "log-level")]
    log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // An explicit path must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {:#}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// The configured log level, without parsing the rest of the file
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => Self::candidates(),
        };
        candidates.into_iter().filter(|p| p.exists()).find_map(|path| {
            let content = fs::read_to_string(path).ok()?;
            serde_yaml::from_str::<LogLevelOnly>(&content).ok()?.log_level
        })
    }

    fn candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("fixforward").join("fixforward.yml"));
        }
        candidates
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
