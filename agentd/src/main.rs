//! CLI entry point. Parses flags, loads config, wires the engine's
//! components together, and drives one [`agentd::manager::TaskManager`]
//! operation per invocation — glue over the library, not engine logic.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use agentd::backend::{Backend, LocalNullBackend};
use agentd::cli::{Cli, Command};
use agentd::config::Config;
use agentd::domain::{Task, TaskStatus};
use agentd::manager::{SubmitRequest, TaskManager};
use agentd::metrics::Metrics;
use agentd::planner::Planner;
use agentd::reflector::Reflector;
use agentd::tools::{AnthropicToolInvoker, ToolInvoker};
use agentd::worker::Worker;

fn setup_logging(log_level: Option<&str>) {
    let level = log_level
        .and_then(|s| s.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

/// Misconfiguration (spec §6 exit code 2): config loading, storage wiring,
/// or tool-invoker construction failed before any task could be admitted.
/// Distinguished from a failed task run (exit code 1), which only happens
/// once the engine is fully wired and actually attempts `Run`.
struct Misconfiguration(eyre::Report);

impl From<eyre::Report> for Misconfiguration {
    fn from(report: eyre::Report) -> Self {
        Misconfiguration(report)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref());

    let (manager, command) = match wire(&cli).await {
        Ok(pair) => pair,
        Err(Misconfiguration(report)) => {
            eprintln!("misconfiguration: {report:#}");
            std::process::exit(2);
        }
    };

    match command {
        Command::Run {
            instruction,
            backend: backend_name,
            max_steps,
            mode,
            platform,
            enable_takeover,
            disable_search: _,
        } => {
            debug!(%backend_name, "cli: run command");
            if backend_name != "local_gui" {
                eprintln!(
                    "warning: backend '{backend_name}' is not implemented by this binary, using the local_gui stub"
                );
            }
            cmd_run(&manager, instruction, max_steps, mode.into(), platform.into(), enable_takeover).await
        }
        Command::Query { task_id } => cmd_query(&manager, &task_id).await,
        Command::Cancel { task_id } => cmd_cancel(&manager, &task_id).await,
        Command::List { limit, offset } => cmd_list(&manager, limit, offset).await,
        Command::Info => cmd_info(&manager),
    }
}

/// Loads configuration and constructs every engine component the CLI needs,
/// without running any task. Any failure here is a misconfiguration (spec
/// §6 exit code 2), not a task failure — nothing has been admitted yet.
async fn wire(cli: &Cli) -> Result<(TaskManager, Command), Misconfiguration> {
    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    info!(backend = %config.storage.backend, max_concurrent = config.concurrency.max_concurrent, "agentd starting");

    let store: Arc<dyn taskstore::StoreBackend<Task>> = match config.storage.backend.as_str() {
        "sql" => {
            let path = config
                .storage
                .connection_string
                .clone()
                .ok_or_else(|| eyre::eyre!("TASK_STORAGE_BACKEND=sql requires SQL_CONNECTION_STRING"))?;
            Arc::new(taskstore::SqliteStore::<Task>::open(&path).context("failed to open sqlite store")?)
        }
        "memory" => Arc::new(taskstore::MemoryStore::<Task>::new()),
        other => return Err(eyre::eyre!("unknown storage backend '{other}', expected memory or sql").into()),
    };

    let backend: Arc<dyn Backend> = Arc::new(LocalNullBackend::new());
    let metrics = Arc::new(Metrics::new(config.metrics.enabled, config.concurrency.max_concurrent));
    let tool_invoker: Arc<dyn ToolInvoker> = Arc::new(
        AnthropicToolInvoker::from_config(&config.llm, metrics.clone())
            .map_err(|e| eyre::eyre!("failed to initialize tool invoker: {e}"))?,
    );
    let planner = Arc::new(Planner::new(tool_invoker.clone()));
    let worker = Arc::new(Worker::new(tool_invoker.clone()));
    let reflector = Arc::new(Reflector::new(tool_invoker, &config.reflector));

    let manager = TaskManager::new(store, backend, planner, worker, reflector, config, metrics);
    Ok((manager, cli.command.clone()))
}

async fn cmd_run(
    manager: &TaskManager,
    instruction: String,
    max_steps: Option<u32>,
    mode: agentd::domain::TaskMode,
    platform: agentd::domain::Platform,
    enable_takeover: bool,
) -> Result<()> {
    let request = SubmitRequest {
        instruction,
        max_steps,
        mode,
        platform,
        enable_takeover,
        ..Default::default()
    };

    let (task_id, mut subscription) = manager
        .run_streaming(request)
        .await
        .map_err(|e| eyre::eyre!("submit failed: {e}"))?;
    println!("task {task_id} submitted");

    while let Some(event) = subscription.recv().await {
        println!("[{}] {}: {}", event.seq, event.stage, event.message);
        if event.stage.is_terminal() {
            break;
        }
    }

    let summary = manager.query(&task_id).await.map_err(|e| eyre::eyre!("query failed: {e}"))?;
    match summary.status {
        TaskStatus::Completed => Ok(()),
        TaskStatus::Cancelled => std::process::exit(130),
        _ => std::process::exit(1),
    }
}

async fn cmd_query(manager: &TaskManager, task_id: &str) -> Result<()> {
    let summary = manager.query(task_id).await.map_err(|e| eyre::eyre!("query failed: {e}"))?;
    println!("task_id: {}", summary.task_id);
    println!("status: {}", summary.status);
    println!("steps: {}", summary.steps);
    println!("instruction: {}", summary.instruction);
    Ok(())
}

async fn cmd_cancel(manager: &TaskManager, task_id: &str) -> Result<()> {
    let cancelled = manager.cancel(task_id).await.map_err(|e| eyre::eyre!("cancel failed: {e}"))?;
    println!("cancelled: {cancelled}");
    Ok(())
}

async fn cmd_list(manager: &TaskManager, limit: usize, offset: usize) -> Result<()> {
    let (tasks, total) = manager.list(limit, offset).await.map_err(|e| eyre::eyre!("list failed: {e}"))?;
    println!("{:<38} {:<10} {:>6}  instruction", "TASK_ID", "STATUS", "STEPS");
    for task in &tasks {
        println!("{:<38} {:<10} {:>6}  {}", task.task_id, task.status, task.steps, task.instruction);
    }
    println!("\n{} of {} total", tasks.len(), total);
    Ok(())
}

fn cmd_info(manager: &TaskManager) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&manager.agent_info())?);
    Ok(())
}
