use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use checkpointstore::cli::{Cli, Command};
use checkpointstore::config::StoreConfig;
use checkpointstore::{Checkpoint, CheckpointStatus, CheckpointStore};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    Ok(())
}

fn status_colored(status: CheckpointStatus) -> ColoredString {
    match status {
        CheckpointStatus::Running => status.as_str().yellow(),
        CheckpointStatus::Done => status.as_str().green(),
        CheckpointStatus::Failed => status.as_str().red(),
        CheckpointStatus::MaxIterations => status.as_str().magenta(),
        CheckpointStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!(
        "{} {:<14} iteration {:>3}  {}",
        checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        checkpoint.step_name,
        checkpoint.iteration,
        status_colored(checkpoint.status)
    );
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let mut config = StoreConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let store_path = cli.store.unwrap_or_else(|| config.state_dir.clone());

    info!("checkpointstore opening {}", store_path.display());
    let store = CheckpointStore::open(&store_path)?;

    match cli.command {
        Command::List => {
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions found");
            }
            for session_id in sessions {
                match store.session(&session_id)?.read_latest()? {
                    Some(latest) => println!(
                        "{:<32} {:>3}  {}",
                        session_id.cyan(),
                        latest.iteration,
                        status_colored(latest.status)
                    ),
                    None => println!("{:<32}   -  {}", session_id.cyan(), "no snapshot".dimmed()),
                }
            }
        }
        Command::Show { session_id, json } => {
            let latest = store
                .session(&session_id)?
                .read_latest()?
                .ok_or_else(|| eyre::eyre!("No checkpoint for session: {}", session_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            } else {
                println!("Session: {}", session_id.cyan());
                print_checkpoint(&latest);
                for (key, value) in &latest.metrics {
                    println!("  {}: {}", key, value);
                }
            }
        }
        Command::History { session_id, limit } => {
            if let Some(limit) = limit {
                config.history_limit = limit;
            }
            let history = config.limit_history(store.session(&session_id)?.history()?);
            if history.is_empty() {
                println!("No history for session: {}", session_id);
            }
            for checkpoint in &history {
                print_checkpoint(checkpoint);
            }
        }
        Command::Results => {
            let records: Vec<serde_json::Value> = store.results().read_all()?;
            if records.is_empty() {
                println!("No results recorded");
            }
            for record in records {
                println!("{}", record);
            }
        }
    }

    Ok(())
}
