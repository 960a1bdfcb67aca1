use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use shellpilot::api::ApiClient;
use shellpilot::config::{Config, ExecutionMode, Language};
use shellpilot::engine::cancel::CancelToken;
use shellpilot::engine::confirmation::{ConfirmationDecision, ConfirmationSlot};
use shellpilot::engine::events::{ChannelEmitter, EngineEvent};
use shellpilot::engine::{AgentEngine, RunStatus};
use shellpilot::history::RunHistoryStore;
use shellpilot::knowledge::{Bm25KnowledgeStore, HostProfileStore};
use shellpilot::mcp::McpRegistry;
use shellpilot::orchestrator::{Orchestrator, OrchestratorDeps};
use shellpilot::output;
use shellpilot::safety::{AutoCorrection, RiskAssessor};
use shellpilot::terminal::{PipeTerminal, TerminalManager, TerminalSession};
use shellpilot::tools::file::FileAccess;
use shellpilot::tools::interact::StdinUserIo;
use shellpilot::tools::ToolContext;

#[derive(Parser)]
#[command(name = "shellpilot", about = "AI operations agent that drives terminals", version)]
struct Cli {
    /// Path to config.toml (default: ~/.config/shellpilot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Execution mode override
    #[arg(long, global = true, value_enum)]
    mode: Option<ExecutionMode>,

    /// Language override for user-visible strings
    #[arg(long, global = true, value_enum)]
    lang: Option<Language>,

    /// Minimal output
    #[arg(long, global = true)]
    compact: bool,

    /// Extra detail (model thoughts, tool arguments)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task against a local terminal
    Run {
        /// The task, in natural language
        task: Vec<String>,
    },
    /// Run a fleet task through the master orchestrator
    Orchestrate {
        /// The fleet task, in natural language
        task: Vec<String>,
    },
    /// Classify a command's risk level without executing it
    Risk {
        /// The shell command to assess
        command: Vec<String>,
    },
    /// Show recent run history
    History {
        /// How many runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    output::init(cli.compact, cli.verbose);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.execution_mode = mode;
    }
    if let Some(lang) = cli.lang {
        config.language = lang;
    }

    match cli.command {
        Commands::Run { task } => run_single(config, task.join(" ")).await,
        Commands::Orchestrate { task } => run_orchestrated(config, task.join(" ")).await,
        Commands::Risk { command } => assess_risk(command.join(" ")),
        Commands::History { limit } => show_history(limit).await,
    }
}

fn build_engine(config: &Config) -> Result<AgentEngine> {
    let client = Arc::new(ApiClient::new(config)?);
    let history = Arc::new(RunHistoryStore::new(RunHistoryStore::default_path()));
    let (emitter, events) = ChannelEmitter::new();
    spawn_renderer(events);
    Ok(AgentEngine::new(client, config.clone())
        .with_history(history)
        .with_emitter(Arc::new(emitter)))
}

/// Render engine events on the console as they arrive.
fn spawn_renderer(events: std::sync::mpsc::Receiver<EngineEvent>) {
    std::thread::spawn(move || {
        for event in events {
            match event {
                EngineEvent::TextDelta { text, .. } => output::thought_delta(&text),
                EngineEvent::ToolStarted {
                    tool_name,
                    args_preview,
                    ..
                } => output::tool_call(&tool_name, &args_preview),
                EngineEvent::ToolFinished {
                    tool_name, success, ..
                } => {
                    if success {
                        output::tool_success(&tool_name);
                    } else {
                        output::tool_failure(&tool_name, "failed");
                    }
                }
                EngineEvent::ReflectionInjected { issues, .. } => {
                    output::reflection_injected(&issues.join(", "));
                }
                // Confirmations are prompted by the confirmer task; the
                // final answer lands in the run summary.
                EngineEvent::ConfirmationRequested { .. } | EngineEvent::RunFinished { .. } => {}
                EngineEvent::StrategySwitched { to, .. } => {
                    output::reflection_injected(&format!("strategy -> {}", to));
                }
            }
        }
    });
}

/// Prompt the operator about one pending confirmation and resolve it.
async fn prompt_and_resolve(confirmations: &ConfirmationSlot) {
    let Some((tool_call_id, tool_name, risk)) = confirmations.peek().await else {
        return;
    };
    output::risk_notice(&tool_name, &risk.to_string());
    let answer = tokio::task::spawn_blocking(|| {
        use std::io::Write;
        print!("{}", "Execute? [y/N]: ".bright_yellow());
        std::io::stdout().flush().ok();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok();
        line.trim().to_lowercase()
    })
    .await
    .unwrap_or_default();

    let decision = if answer == "y" || answer == "yes" {
        ConfirmationDecision::approved()
    } else {
        ConfirmationDecision::rejected()
    };
    confirmations.resolve(&tool_call_id, decision).await;
}

/// Watch the confirmation slot and prompt the operator on stdin.
fn spawn_confirmer(confirmations: Arc<ConfirmationSlot>, cancel: CancelToken) {
    tokio::spawn(async move {
        while !cancel.is_cancelled() {
            prompt_and_resolve(&confirmations).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
}

fn spawn_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "interrupt received, aborting run".bright_red());
            cancel.cancel();
        }
    });
}

async fn run_single(config: Config, task: String) -> Result<()> {
    if task.trim().is_empty() {
        anyhow::bail!("no task given");
    }
    let engine = build_engine(&config)?;
    let cancel = CancelToken::new();
    spawn_ctrl_c(cancel.clone());

    let terminal: Arc<dyn TerminalSession> = Arc::new(
        PipeTerminal::spawn_local("term-local", None).context("spawning local shell")?,
    );
    let manager = TerminalManager::new();
    manager.insert(Arc::clone(&terminal)).await;

    let host_id = whoami::hostname().unwrap_or_else(|_| "local".to_string());
    let ctx = ToolContext {
        terminal: manager.bind("term-local", "cli").await?,
        terminal_cfg: config.terminal.clone(),
        catalog: *engine.catalog(),
        cancel: cancel.clone(),
        knowledge: Arc::new(Bm25KnowledgeStore::new()),
        profiles: Arc::new(HostProfileStore::new()),
        host_id,
        plan: Arc::new(Mutex::new(None)),
        mcp: Arc::new(McpRegistry::new()),
        user_io: Arc::new(StdinUserIo),
        user_wake: Arc::new(Notify::new()),
        files: FileAccess::Local,
    };

    let confirmations = Arc::new(ConfirmationSlot::new());
    spawn_confirmer(Arc::clone(&confirmations), cancel.clone());

    let run = engine.run_task(&task, &ctx, &confirmations).await;
    debug!(run_id = %run.id, "run record written");

    output::run_summary(
        engine.catalog(),
        &run.task,
        &run.status.to_string(),
        &run.final_answer,
        if run.status == RunStatus::Failed {
            run.last_error.as_deref()
        } else {
            None
        },
    );
    if run.status == RunStatus::Completed {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

async fn run_orchestrated(config: Config, task: String) -> Result<()> {
    if task.trim().is_empty() {
        anyhow::bail!("no task given");
    }
    if config.hosts.is_empty() {
        anyhow::bail!("no [[hosts]] configured; the orchestrator needs a host catalog");
    }
    let engine = build_engine(&config)?;
    let orchestrator = Orchestrator::new(
        engine.clone(),
        Arc::new(TerminalManager::new()),
        OrchestratorDeps {
            knowledge: Arc::new(Bm25KnowledgeStore::new()),
            profiles: Arc::new(HostProfileStore::new()),
            mcp: Arc::new(McpRegistry::new()),
            user_io: Arc::new(StdinUserIo),
        },
    );
    spawn_ctrl_c(orchestrator.cancel_token());

    // Route worker confirmations (strict/relaxed modes) to the operator.
    let orchestrator = Arc::new(orchestrator);
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            loop {
                if let Some(slot) = orchestrator.pending_worker_confirmation().await {
                    prompt_and_resolve(&slot).await;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });
    }

    let run = orchestrator.run(&task).await;
    output::run_summary(
        engine.catalog(),
        &run.task,
        &run.status.to_string(),
        &run.final_answer,
        if run.status == RunStatus::Failed {
            run.last_error.as_deref()
        } else {
            None
        },
    );
    if run.status == RunStatus::Completed {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

fn assess_risk(command: String) -> Result<()> {
    let assessor = RiskAssessor::new();
    let assessed = assessor
        .assess(&command)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    match assessed.reason {
        Some(reason) => println!("{} ({})", assessed.level, reason),
        None => println!("{}", assessed.level),
    }
    match assessor.auto_correct(&command) {
        Some(AutoCorrection::Rewrite { corrected, note }) => {
            println!("auto-correction: {} ({})", corrected, note);
        }
        Some(AutoCorrection::Reject { reason }) => {
            println!("auto-correction: rejected ({})", reason);
        }
        None => {}
    }
    Ok(())
}

async fn show_history(limit: usize) -> Result<()> {
    let store = RunHistoryStore::new(RunHistoryStore::default_path());
    let records = store.load().await?;
    if records.is_empty() {
        println!("no runs recorded yet");
        return Ok(());
    }
    for record in records.iter().rev().take(limit) {
        println!(
            "{}  {}  [{} steps]  {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.status,
            record.steps,
            record.task
        );
    }
    Ok(())
}
