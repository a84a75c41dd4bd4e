//! Fixforward - fix-forward orchestrator
//!
//! CLI entry point for running sessions and batches.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use checkpointstore::{Checkpoint, CheckpointStore};
use fixforward::cli::{Cli, Command, OutputFormat, log_dir};
use fixforward::config::Config;
use fixforward::executor::{ParallelExecutor, WorkItem, WorkResult};
use fixforward::provider::ProviderManager;
use fixforward::r#loop::{RunOutcome, RunStatus};
use fixforward::session::{SessionController, SessionSpec};
use fixforward::verify::CommandVerifier;
use fixforward::workspace;

fn setup_logging(verbose: bool, level: Option<String>) -> Result<()> {
    let log_dir = log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose {
        "debug".to_string()
    } else {
        level.unwrap_or_else(|| "info".to_string())
    };
    let log_file = fs::File::create(log_dir.join("fixforward.log")).context("Failed to create log file")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, Config::load_log_level(cli.config.as_ref())).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let state_dir = cli.state_dir.clone().unwrap_or_else(|| config.storage.state_dir.clone());
    info!(state_dir = %state_dir.display(), adapters = config.providers.adapters.len(), "Fixforward loaded config");

    let code = match cli.command {
        Command::Run {
            task,
            workspace,
            id,
            max_iterations,
            task_type,
            timeout_ms,
            resume,
            format,
        } => {
            let spec = RunArgs {
                task,
                workspace,
                id,
                max_iterations,
                task_type,
                timeout_ms,
                resume,
            };
            cmd_run(&config, &state_dir, spec, format).await?
        }
        Command::Batch {
            items,
            max_concurrency,
            resume,
            format,
        } => cmd_batch(config, &state_dir, &items, max_concurrency, resume, format).await?,
        Command::Providers { format } => cmd_providers(&config, format).await?,
        Command::Checkpoints {
            session_id,
            history,
            format,
        } => cmd_checkpoints(&state_dir, &session_id, history, format)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

struct RunArgs {
    task: String,
    workspace: PathBuf,
    id: Option<String>,
    max_iterations: Option<u32>,
    task_type: Option<String>,
    timeout_ms: Option<u64>,
    resume: bool,
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Done => 0,
        RunStatus::Failed => 1,
        RunStatus::MaxIterations => 2,
        RunStatus::Cancelled => 130,
    }
}

fn status_colored(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Done => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
        RunStatus::MaxIterations => status.as_str().magenta(),
        RunStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn build_providers(config: &Config) -> Result<Arc<ProviderManager>> {
    if config.providers.adapters.is_empty() {
        return Err(eyre::eyre!(
            "No provider adapters configured. Add at least one entry under providers.adapters."
        ));
    }
    let manager = ProviderManager::from_config(&config.providers, Some(&config.engine.completion_marker))
        .context("Failed to build provider adapters")?;
    Ok(Arc::new(manager))
}

fn build_controller(config: &Config, store: CheckpointStore) -> Result<SessionController> {
    let providers = build_providers(config)?;
    let verifier = Arc::new(CommandVerifier::from_config(&config.verification));
    Ok(SessionController::new(providers, verifier, config.engine.clone())
        .with_config(config.session.clone())
        .with_store(store))
}

/// Token cancelled on the first Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            eprintln!("Interrupted, cancelling...");
            trigger.cancel();
        }
    });
    token
}

/// Run a single session in an existing directory
async fn cmd_run(config: &Config, state_dir: &Path, args: RunArgs, format: OutputFormat) -> Result<i32> {
    let store = CheckpointStore::open(state_dir)?;
    let controller = build_controller(config, store)?;

    let workspace = args
        .workspace
        .canonicalize()
        .context(format!("Workspace not found: {}", args.workspace.display()))?;
    let id = args
        .id
        .unwrap_or_else(|| format!("run-{}", uuid::Uuid::now_v7().simple()));
    let timeout = config
        .timeouts
        .backend_timeout(args.task_type.as_deref(), args.timeout_ms);

    let mut spec = SessionSpec::new(&id, args.task, workspace)
        .with_backend_timeout(timeout)
        .with_resume_completed(args.resume);
    if let Some(max_iterations) = args.max_iterations {
        spec = spec.with_max_iterations(max_iterations);
    }

    if format == OutputFormat::Text {
        println!("Session {} started", id.cyan());
    }
    let handle = controller.start(spec)?;
    let outcome = handle.wait_or_cancel(&ctrl_c_token()).await;
    info!(session_id = %id, status = %outcome.status, iterations = outcome.iterations, "Session finished");

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print_outcome(&id, &outcome),
    }
    Ok(exit_code(outcome.status))
}

fn print_outcome(id: &str, outcome: &RunOutcome) {
    println!(
        "{} {} after {} iteration(s)",
        id.cyan(),
        status_colored(outcome.status),
        outcome.iterations
    );
    println!("  {}", outcome.message);
    if let Some(kind) = outcome.error_kind {
        println!("  error kind: {}", kind);
    }
}

/// Run work items from a YAML file in parallel
async fn cmd_batch(
    mut config: Config,
    state_dir: &Path,
    items_path: &Path,
    max_concurrency: Option<usize>,
    resume: bool,
    format: OutputFormat,
) -> Result<i32> {
    let content = fs::read_to_string(items_path).context(format!("Failed to read {}", items_path.display()))?;
    let items: Vec<WorkItem> =
        serde_yaml::from_str(&content).context(format!("Failed to parse work items in {}", items_path.display()))?;
    if items.is_empty() {
        println!("No work items in {}", items_path.display());
        return Ok(0);
    }

    if let Some(max_concurrency) = max_concurrency {
        config.parallel.max_concurrency = max_concurrency;
    }
    config.parallel.resume_completed |= resume;

    let store = CheckpointStore::open(state_dir)?;
    let controller = build_controller(&config, store.clone())?;
    let provisioner = workspace::provisioner(&config.parallel.workspace);
    let executor = ParallelExecutor::new(controller, provisioner, config.parallel.clone())
        .with_timeouts(config.timeouts.clone())
        .with_results(store.results());

    let interrupted = ctrl_c_token();
    let stop = executor.stop_token();
    tokio::spawn(async move {
        interrupted.cancelled().await;
        stop.cancel();
    });

    if format == OutputFormat::Text {
        println!(
            "Running {} work item(s), {} at a time",
            items.len(),
            config.parallel.max_concurrency.max(1)
        );
    }
    let results = executor.run_all(items).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Text => print_results(&results),
    }

    let all_done = results.iter().all(|r| r.status() == RunStatus::Done);
    Ok(if all_done { 0 } else { 1 })
}

fn print_results(results: &[WorkResult]) {
    println!("{:<24} {:<16} {:>10} {:>10}  MESSAGE", "ID", "STATUS", "ITERATIONS", "SECONDS");
    for result in results {
        println!(
            "{:<24} {:<16} {:>10} {:>10.1}  {}",
            result.id,
            status_colored(result.status()),
            result.outcome.iterations,
            result.duration_ms as f64 / 1000.0,
            result.outcome.message
        );
    }
    let done = results.iter().filter(|r| r.status() == RunStatus::Done).count();
    println!();
    println!("{}/{} done", done, results.len());
}

/// Show configured providers
async fn cmd_providers(config: &Config, format: OutputFormat) -> Result<i32> {
    let manager = build_providers(config)?;

    let mut rows = Vec::new();
    for (adapter, report) in manager.adapters().iter().zip(manager.health_report()) {
        let available = adapter.available().await;
        rows.push((available, report));
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = rows
                .iter()
                .map(|(available, report)| {
                    let mut value = serde_json::to_value(report).unwrap_or_default();
                    value["available"] = serde_json::json!(available);
                    value
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("{:<16} {:<10} {:>6}  CAPABILITIES", "NAME", "AVAILABLE", "SCORE");
            for (available, report) in &rows {
                let name = if report.active {
                    format!("{} *", report.name)
                } else {
                    report.name.clone()
                };
                let available = if *available { "yes".green() } else { "no".red() };
                let tiers: Vec<String> = report
                    .capabilities
                    .reasoning_tiers
                    .iter()
                    .map(|t| format!("{:?}", t).to_lowercase())
                    .collect();
                println!(
                    "{:<16} {:<10} {:>6.1}  tiers={} context={}",
                    name,
                    available,
                    report.score,
                    tiers.join(","),
                    report.capabilities.context_window
                );
            }
        }
    }
    Ok(0)
}

/// Show the checkpoints of a session
fn cmd_checkpoints(state_dir: &Path, session_id: &str, history: bool, format: OutputFormat) -> Result<i32> {
    let store = CheckpointStore::open(state_dir)?;
    let sink = store.session(session_id)?;

    let checkpoints: Vec<Checkpoint> = if history {
        sink.history()?
    } else {
        sink.read_latest()?.into_iter().collect()
    };
    if checkpoints.is_empty() {
        println!("No checkpoints for session: {}", session_id);
        return Ok(1);
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&checkpoints)?),
        OutputFormat::Text => {
            for checkpoint in &checkpoints {
                println!(
                    "{} {:<14} iteration {:>3}  {}",
                    checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    checkpoint.step_name,
                    checkpoint.iteration,
                    checkpoint.status
                );
            }
        }
    }
    Ok(0)
}
