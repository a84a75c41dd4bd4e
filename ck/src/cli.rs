//! CLI argument parsing for checkpointstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ck")]
#[command(author, version, about = "Inspect fix-forward session checkpoints", long_about = None)]
pub struct Cli {
    /// Fixforward config file; only its `storage` section is read
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides config)
    #[arg(short, long)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List sessions with checkpoints
    List,

    /// Show the latest checkpoint of a session
    Show {
        /// Session ID
        #[arg(required = true)]
        session_id: String,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the newest checkpoints of a session
    History {
        /// Session ID
        #[arg(required = true)]
        session_id: String,

        /// Entries to show (overrides storage.history-limit, 0 shows all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show recorded terminal results
    Results,
}
