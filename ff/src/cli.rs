//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Fixforward - fix-forward orchestrator for AI coding agents
#[derive(Parser)]
#[command(
    name = "ff",
    about = "Drive AI coding agents forward until tests and lints pass",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/fixforward/logs/fixforward.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Checkpoint store directory (overrides storage.state-dir)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run one fix-forward session in an existing directory
    Run {
        /// Task description
        task: String,

        /// Directory the agent works in
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Session id; resumes from its checkpoint when one exists
        #[arg(long)]
        id: Option<String>,

        /// Maximum iterations
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Task type used to pick the backend timeout
        #[arg(short = 't', long)]
        task_type: Option<String>,

        /// Backend timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Report the recorded outcome if the session already finished
        #[arg(long)]
        resume: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a YAML list of work items in parallel, each in its own workspace
    Batch {
        /// YAML file with a list of work items
        items: PathBuf,

        /// Concurrent sessions (overrides parallel.max-concurrency)
        #[arg(short = 'j', long)]
        max_concurrency: Option<usize>,

        /// Reuse recorded results for finished items
        #[arg(long)]
        resume: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show configured providers with availability and health
    Providers {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the checkpoints of a session
    Checkpoints {
        /// Session ID
        session_id: String,

        /// Show every checkpoint, not just the latest
        #[arg(long)]
        history: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for command results
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" | "table" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Directory holding the log file
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fixforward")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["ff", "run", "Fix the bug"]);
        if let Command::Run {
            task,
            workspace,
            id,
            max_iterations,
            format,
            ..
        } = cli.command
        {
            assert_eq!(task, "Fix the bug");
            assert_eq!(workspace, PathBuf::from("."));
            assert!(id.is_none());
            assert!(max_iterations.is_none());
            assert_eq!(format, OutputFormat::Text);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_run_options() {
        let cli = Cli::parse_from([
            "ff", "run", "task", "-w", "/src", "--id", "fix-1", "-m", "5", "-t", "refactor", "-f", "json", "--resume",
        ]);
        if let Command::Run {
            workspace,
            id,
            max_iterations,
            task_type,
            resume,
            format,
            ..
        } = cli.command
        {
            assert!(resume);
            assert_eq!(workspace, PathBuf::from("/src"));
            assert_eq!(id.as_deref(), Some("fix-1"));
            assert_eq!(max_iterations, Some(5));
            assert_eq!(task_type.as_deref(), Some("refactor"));
            assert_eq!(format, OutputFormat::Json);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_batch() {
        let cli = Cli::parse_from(["ff", "batch", "items.yml", "-j", "8", "--resume"]);
        assert!(matches!(
            cli.command,
            Command::Batch {
                max_concurrency: Some(8),
                resume: true,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_checkpoints() {
        let cli = Cli::parse_from(["ff", "checkpoints", "fix-1", "--history"]);
        assert!(matches!(cli.command, Command::Checkpoints { history: true, .. }));
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("invalid".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_cli_with_global_options() {
        let cli = Cli::parse_from(["ff", "providers", "-c", "/path/to/config.yml", "--state-dir", "/tmp/state"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/state")));
    }
}
