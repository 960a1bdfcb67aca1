//! Master/worker orchestration.
//!
//! The master agent runs the same ReAct loop as a worker but with a
//! different tool catalog: it lists hosts, opens terminals, dispatches
//! sub-tasks (sequentially or in parallel) and synthesises a severity-
//! classified report from the collected results. Each dispatch spawns a
//! full inner [`AgentRun`] bound to one terminal with its own reflection
//! state and a child cancel token, so aborting the master tears down the
//! whole patrol.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::config::{Config, HostKind};
use crate::engine::cancel::CancelToken;
use crate::engine::confirmation::ConfirmationSlot;
use crate::engine::{AgentEngine, AgentRun, RunStatus};
use crate::knowledge::{HostProfileStore, KnowledgeStore};
use crate::mcp::McpRegistry;
use crate::terminal::TerminalManager;
use crate::tools::file::{FileAccess, RemoteFileStore};
use crate::tools::interact::UserIo;
use crate::tools::{parse_args, Tool, ToolContext, ToolRegistry, ToolResult};

/// Severity scale for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Result of one dispatched worker run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerOutcome {
    pub terminal_id: String,
    pub task: String,
    pub status: String,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub steps: usize,
}

impl WorkerOutcome {
    fn from_run(terminal_id: &str, run: &AgentRun) -> Self {
        Self {
            terminal_id: terminal_id.to_string(),
            task: run.task.clone(),
            status: run.status.to_string(),
            answer: run.final_answer.clone(),
            last_error: run.last_error.clone(),
            steps: run.reflection.tool_call_count,
        }
    }

    fn render(&self) -> String {
        let mut out = format!("[{}] status={} steps={}", self.terminal_id, self.status, self.steps);
        if !self.answer.is_empty() {
            out.push_str(&format!("\n{}", self.answer));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!("\nlast error: {}", err));
        }
        out
    }
}

/// Remote file transport placeholder until the host app wires SFTP in.
struct UnconfiguredRemote;

#[async_trait]
impl RemoteFileStore for UnconfiguredRemote {
    async fn read(&self, path: &str) -> Result<String> {
        anyhow::bail!("no remote file transport configured (reading {})", path)
    }
    async fn exists(&self, _path: &str) -> Result<bool> {
        anyhow::bail!("no remote file transport configured")
    }
    async fn write(&self, path: &str, _content: &str, _append: bool) -> Result<()> {
        anyhow::bail!("no remote file transport configured (writing {})", path)
    }
}

/// Shared state behind the master's tools.
pub struct OrchestratorState {
    config: Config,
    engine: AgentEngine,
    terminals: Arc<TerminalManager>,
    knowledge: Arc<dyn KnowledgeStore>,
    profiles: Arc<HostProfileStore>,
    mcp: Arc<McpRegistry>,
    user_io: Arc<dyn UserIo>,
    user_wake: Arc<Notify>,
    cancel: CancelToken,
    results: Mutex<Vec<WorkerOutcome>>,
    host_of_terminal: Mutex<HashMap<String, String>>,
    worker_confirmations: Mutex<HashMap<String, Arc<ConfirmationSlot>>>,
}

impl OrchestratorState {
    /// Worker tool context bound to one terminal, with a child cancel
    /// token and fresh plan slot.
    async fn worker_ctx(&self, terminal_id: &str, run_id: &str) -> Result<ToolContext> {
        let terminal = self.terminals.bind(terminal_id, run_id).await?;
        let host_id = self
            .host_of_terminal
            .lock()
            .await
            .get(terminal_id)
            .cloned()
            .unwrap_or_else(|| terminal_id.to_string());
        let files = match self.config.find_host(&host_id).map(|h| h.kind) {
            Some(HostKind::Ssh) => FileAccess::Remote(Arc::new(UnconfiguredRemote)),
            _ => FileAccess::Local,
        };
        Ok(ToolContext {
            terminal,
            terminal_cfg: self.config.terminal.clone(),
            catalog: *self.engine.catalog(),
            cancel: self.cancel.child(),
            knowledge: Arc::clone(&self.knowledge),
            profiles: Arc::clone(&self.profiles),
            host_id,
            plan: Arc::new(Mutex::new(None)),
            mcp: Arc::clone(&self.mcp),
            user_io: Arc::clone(&self.user_io),
            user_wake: Arc::clone(&self.user_wake),
            files,
        })
    }

    async fn dispatch_one(&self, terminal_id: &str, task: &str) -> WorkerOutcome {
        let run_id = format!("worker_{}", uuid::Uuid::new_v4());
        let ctx = match self.worker_ctx(terminal_id, &run_id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                return WorkerOutcome {
                    terminal_id: terminal_id.to_string(),
                    task: task.to_string(),
                    status: RunStatus::Failed.to_string(),
                    answer: String::new(),
                    last_error: Some(e.to_string()),
                    steps: 0,
                }
            }
        };

        let confirmations = Arc::new(ConfirmationSlot::new());
        self.worker_confirmations
            .lock()
            .await
            .insert(terminal_id.to_string(), Arc::clone(&confirmations));

        info!(terminal_id, task, "dispatching worker run");
        let run = self.engine.run_task(task, &ctx, &confirmations).await;
        self.terminals.release(terminal_id, &run.id).await;
        self.worker_confirmations.lock().await.remove(terminal_id);
        WorkerOutcome::from_run(terminal_id, &run)
    }
}

/// Master agent over a fleet of terminals.
pub struct Orchestrator {
    state: Arc<OrchestratorState>,
}

pub struct OrchestratorDeps {
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub profiles: Arc<HostProfileStore>,
    pub mcp: Arc<McpRegistry>,
    pub user_io: Arc<dyn UserIo>,
}

impl Orchestrator {
    pub fn new(
        engine: AgentEngine,
        terminals: Arc<TerminalManager>,
        deps: OrchestratorDeps,
    ) -> Self {
        let config = engine.config().clone();
        Self {
            state: Arc::new(OrchestratorState {
                config,
                engine,
                terminals,
                knowledge: deps.knowledge,
                profiles: deps.profiles,
                mcp: deps.mcp,
                user_io: deps.user_io,
                user_wake: Arc::new(Notify::new()),
                cancel: CancelToken::new(),
                results: Mutex::new(Vec::new()),
                host_of_terminal: Mutex::new(HashMap::new()),
                worker_confirmations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Token that aborts the master and every dispatched worker.
    pub fn cancel_token(&self) -> CancelToken {
        self.state.cancel.clone()
    }

    /// Confirmation slot of a live worker, for frontends that gate them.
    pub async fn worker_confirmations(&self, terminal_id: &str) -> Option<Arc<ConfirmationSlot>> {
        self.state
            .worker_confirmations
            .lock()
            .await
            .get(terminal_id)
            .cloned()
    }

    /// First worker slot with a confirmation waiting, if any. Frontends
    /// poll this to route approvals during a patrol.
    pub async fn pending_worker_confirmation(&self) -> Option<Arc<ConfirmationSlot>> {
        let slots: Vec<Arc<ConfirmationSlot>> = self
            .state
            .worker_confirmations
            .lock()
            .await
            .values()
            .cloned()
            .collect();
        for slot in slots {
            if slot.peek().await.is_some() {
                return Some(slot);
            }
        }
        None
    }

    /// Run the master loop for one fleet task.
    pub async fn run(&self, task: &str) -> AgentRun {
        let mut registry = ToolRegistry::empty();
        registry.register(ListAvailableHosts {
            state: Arc::clone(&self.state),
        });
        registry.register(ConnectTerminal {
            state: Arc::clone(&self.state),
        });
        registry.register(DispatchTask {
            state: Arc::clone(&self.state),
        });
        registry.register(ParallelDispatch {
            state: Arc::clone(&self.state),
        });
        registry.register(CollectResults {
            state: Arc::clone(&self.state),
        });
        registry.register(AnalyzeAndReport);

        let system_prompt = self.master_prompt(&registry);
        let confirmations = ConfirmationSlot::new();
        self.state
            .engine
            .run_with_registry(task, system_prompt, &registry, &self.state.cancel, &confirmations)
            .await
    }

    fn master_prompt(&self, registry: &ToolRegistry) -> String {
        let mut hosts = String::new();
        for host in &self.state.config.hosts {
            hosts.push_str(&format!(
                "- {} ({:?}){}\n",
                host.id,
                host.kind,
                host.alias
                    .as_ref()
                    .map(|a| format!(", alias {}", a))
                    .unwrap_or_default()
            ));
        }
        if hosts.is_empty() {
            hosts.push_str("- (none configured)\n");
        }
        let mut tools = String::new();
        for def in registry.definitions() {
            tools.push_str(&format!("- {}: {}\n", def.function.name, def.function.description));
        }
        format!(
            "You are ShellPilot's fleet coordinator. You do not run shell commands \
yourself; you open terminals on hosts, dispatch sub-tasks to worker agents, \
collect their results, and synthesise one report.\n\n\
Work pattern: connect_terminal for each host you need, dispatch_task (or \
parallel_dispatch for independent hosts), then analyze_and_report with a \
severity of info, warning or critical, and finish with a plain-text summary.\n\n\
Configured hosts:\n{}\nAvailable tools:\n{}",
            hosts, tools
        )
    }
}

struct ListAvailableHosts {
    state: Arc<OrchestratorState>,
}

#[async_trait]
impl Tool for ListAvailableHosts {
    fn name(&self) -> &str {
        "list_available_hosts"
    }

    fn description(&self) -> &str {
        "List the hosts terminals can be opened on."
    }

    fn schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<ToolResult> {
        if self.state.config.hosts.is_empty() {
            return Ok(ToolResult::ok("no hosts configured"));
        }
        let lines: Vec<String> = self
            .state
            .config
            .hosts
            .iter()
            .map(|h| {
                format!(
                    "{} kind={:?} alias={}",
                    h.id,
                    h.kind,
                    h.alias.as_deref().unwrap_or("-")
                )
            })
            .collect();
        Ok(ToolResult::ok(lines.join("\n")))
    }
}

struct ConnectTerminal {
    state: Arc<OrchestratorState>,
}

#[async_trait]
impl Tool for ConnectTerminal {
    fn name(&self) -> &str {
        "connect_terminal"
    }

    fn description(&self) -> &str {
        "Open a terminal on a configured host (by id or alias) and return its terminal_id."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "host_id": {"type": "string", "description": "Host id or alias"}
            },
            "required": ["host_id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            host_id: String,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        let Some(host) = self.state.config.find_host(&args.host_id) else {
            return Ok(ToolResult::fail(format!("unknown host: {}", args.host_id)));
        };
        let session = self.state.terminals.open_for_host(host).await?;
        self.state
            .host_of_terminal
            .lock()
            .await
            .insert(session.id().to_string(), host.id.clone());
        Ok(ToolResult::ok(format!("terminal_id: {}", session.id())))
    }
}

struct DispatchTask {
    state: Arc<OrchestratorState>,
}

#[async_trait]
impl Tool for DispatchTask {
    fn name(&self) -> &str {
        "dispatch_task"
    }

    fn description(&self) -> &str {
        "Run a sub-task on one open terminal with a dedicated worker agent; blocks until it finishes."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "terminal_id": {"type": "string"},
                "task": {"type": "string"}
            },
            "required": ["terminal_id", "task"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            terminal_id: String,
            task: String,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let outcome = self.state.dispatch_one(&args.terminal_id, &args.task).await;
        let rendered = outcome.render();
        let failed = outcome.status != RunStatus::Completed.to_string();
        self.state.results.lock().await.push(outcome);
        if failed {
            Ok(ToolResult::fail(rendered))
        } else {
            Ok(ToolResult::ok(rendered))
        }
    }
}

struct ParallelDispatch {
    state: Arc<OrchestratorState>,
}

#[async_trait]
impl Tool for ParallelDispatch {
    fn name(&self) -> &str {
        "parallel_dispatch"
    }

    fn description(&self) -> &str {
        "Run the same sub-task concurrently on several open terminals; blocks until all workers finish. A failing worker does not cancel its siblings."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "terminal_ids": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                "task": {"type": "string"}
            },
            "required": ["terminal_ids", "task"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            terminal_ids: Vec<String>,
            task: String,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        if args.terminal_ids.is_empty() {
            return Ok(ToolResult::fail("terminal_ids must not be empty"));
        }

        let mut futures = FuturesUnordered::new();
        for terminal_id in &args.terminal_ids {
            let state = Arc::clone(&self.state);
            let terminal_id = terminal_id.clone();
            let task = args.task.clone();
            futures.push(async move { state.dispatch_one(&terminal_id, &task).await });
        }

        let mut outcomes: Vec<WorkerOutcome> = Vec::with_capacity(args.terminal_ids.len());
        while let Some(outcome) = futures.next().await {
            outcomes.push(outcome);
        }
        // Keyed and reported by terminal id for deterministic aggregation.
        outcomes.sort_by(|a, b| a.terminal_id.cmp(&b.terminal_id));

        let rendered: Vec<String> = outcomes.iter().map(|o| o.render()).collect();
        let any_failed = outcomes
            .iter()
            .any(|o| o.status != RunStatus::Completed.to_string());
        self.state.results.lock().await.extend(outcomes);

        let output = rendered.join("\n\n");
        if any_failed {
            warn!("parallel dispatch finished with at least one failed worker");
        }
        Ok(ToolResult::ok(output))
    }
}

struct CollectResults {
    state: Arc<OrchestratorState>,
}

#[async_trait]
impl Tool for CollectResults {
    fn name(&self) -> &str {
        "collect_results"
    }

    fn description(&self) -> &str {
        "Return every worker result gathered so far, keyed by terminal."
    }

    fn schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<ToolResult> {
        let results = self.state.results.lock().await;
        if results.is_empty() {
            return Ok(ToolResult::ok("no results collected yet"));
        }
        let rendered: Vec<String> = results.iter().map(|o| o.render()).collect();
        Ok(ToolResult::ok(rendered.join("\n\n")))
    }
}

struct AnalyzeAndReport;

#[async_trait]
impl Tool for AnalyzeAndReport {
    fn name(&self) -> &str {
        "analyze_and_report"
    }

    fn description(&self) -> &str {
        "Record the final synthesis: a severity (info, warning or critical), findings, and recommendations."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "severity": {"type": "string", "enum": ["info", "warning", "critical"]},
                "findings": {"type": "array", "items": {"type": "string"}},
                "recommendations": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["severity", "findings"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            severity: Severity,
            findings: Vec<String>,
            #[serde(default)]
            recommendations: Vec<String>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let mut report = format!("severity: {:?}\n\nFindings:", args.severity);
        for finding in &args.findings {
            report.push_str(&format!("\n- {}", finding));
        }
        if !args.recommendations.is_empty() {
            report.push_str("\n\nRecommendations:");
            for rec in &args.recommendations {
                report.push_str(&format!("\n- {}", rec));
            }
        }
        Ok(ToolResult::ok(report))
    }
}
