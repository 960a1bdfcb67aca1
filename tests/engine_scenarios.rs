//! End-to-end engine scenarios with a scripted LLM and an in-memory
//! terminal: safe execution, risk gating, loops, long-running commands,
//! aborts, and orchestrated parallel dispatch.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Notify};

use shellpilot::api::types::{ChatResponse, Message, ToolCall, ToolDefinition, ToolFunction};
use shellpilot::api::{LlmClient, StreamChunk};
use shellpilot::config::{Config, ExecutionMode, HostEntry, HostKind};
use shellpilot::engine::cancel::CancelToken;
use shellpilot::engine::confirmation::{ConfirmationDecision, ConfirmationSlot};
use shellpilot::engine::events::{ChannelEmitter, EngineEvent};
use shellpilot::engine::{AgentEngine, AgentRun, RunStatus};
use shellpilot::knowledge::{Bm25KnowledgeStore, HostProfileStore};
use shellpilot::mcp::McpRegistry;
use shellpilot::orchestrator::{Orchestrator, OrchestratorDeps};
use shellpilot::terminal::{ShellKind, TerminalManager, TerminalSession};
use shellpilot::tools::file::FileAccess;
use shellpilot::tools::interact::ScriptedUserIo;
use shellpilot::tools::ToolContext;

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Turn {
    content: &'static str,
    tool_calls: Vec<(&'static str, serde_json::Value)>,
}

impl Turn {
    fn text(content: &'static str) -> Self {
        Self {
            content,
            tool_calls: vec![],
        }
    }

    fn tools(calls: Vec<(&'static str, serde_json::Value)>) -> Self {
        Self {
            content: "",
            tool_calls: calls,
        }
    }
}

/// Routes each request to a turn queue by substring match on the task
/// (the first user message), so master and worker scripts coexist.
struct MockLlm {
    routes: Mutex<Vec<(String, VecDeque<Turn>)>>,
    call_count: Mutex<usize>,
}

impl MockLlm {
    fn new(routes: Vec<(&str, Vec<Turn>)>) -> Self {
        Self {
            routes: Mutex::new(
                routes
                    .into_iter()
                    .map(|(task, turns)| (task.to_string(), turns.into()))
                    .collect(),
            ),
            call_count: Mutex::new(0),
        }
    }

    fn single(turns: Vec<Turn>) -> Self {
        Self::new(vec![("", turns)])
    }

    async fn next_turn(&self, messages: &[Message]) -> Turn {
        *self.call_count.lock().await += 1;
        let task = messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let mut routes = self.routes.lock().await;
        for (needle, turns) in routes.iter_mut() {
            if task.contains(needle.as_str()) {
                return turns.pop_front().unwrap_or_else(|| Turn::text("done"));
            }
        }
        Turn::text("done")
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(
        &self,
        messages: Vec<Message>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<ChatResponse> {
        let turn = self.next_turn(&messages).await;
        Ok(ChatResponse {
            id: "mock".into(),
            model: "mock".into(),
            choices: vec![shellpilot::api::types::Choice {
                index: 0,
                message: Message::assistant(turn.content),
                finish_reason: Some("stop".into()),
            }],
            usage: Default::default(),
        })
    }

    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>> {
        let turn = self.next_turn(&messages).await;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if !turn.content.is_empty() {
                let _ = tx
                    .send(Ok(StreamChunk::Content(turn.content.to_string())))
                    .await;
            }
            for (i, (name, args)) in turn.tool_calls.iter().enumerate() {
                let call = ToolCall {
                    id: format!("call_{}", i + 1),
                    call_type: "function".into(),
                    function: ToolFunction {
                        name: name.to_string(),
                        arguments: args.to_string(),
                    },
                };
                let _ = tx.send(Ok(StreamChunk::ToolCall(call))).await;
            }
            let _ = tx.send(Ok(StreamChunk::Done)).await;
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Scripted terminal
// ---------------------------------------------------------------------------

const PROMPT: &str = "ops@mock:~$ ";

/// In-memory terminal. Commands written to it are looked up in a response
/// table; matched commands append their output followed by a fresh prompt,
/// unmatched ones append only their scripted output (no prompt = still
/// running).
struct ScriptedTerminal {
    id: String,
    kind: ShellKind,
    lines: Mutex<Vec<String>>,
    writes: Mutex<Vec<Vec<u8>>>,
    responses: HashMap<String, (String, bool)>,
    last_output: std::sync::Mutex<Instant>,
}

impl ScriptedTerminal {
    fn new(id: &str, responses: Vec<(&str, &str, bool)>) -> Self {
        Self {
            id: id.to_string(),
            kind: ShellKind::Posix,
            lines: Mutex::new(vec![PROMPT.to_string()]),
            writes: Mutex::new(Vec::new()),
            responses: responses
                .into_iter()
                .map(|(cmd, out, completes)| (cmd.to_string(), (out.to_string(), completes)))
                .collect(),
            last_output: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn with_shell_kind(mut self, kind: ShellKind) -> Self {
        self.kind = kind;
        self
    }

    async fn all_writes(&self) -> String {
        let writes = self.writes.lock().await;
        writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl TerminalSession for ScriptedTerminal {
    fn id(&self) -> &str {
        &self.id
    }

    fn shell_kind(&self) -> ShellKind {
        self.kind
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        self.writes.lock().await.push(bytes.to_vec());
        let text = String::from_utf8_lossy(bytes);
        let command = text.trim();
        if let Some((output, completes)) = self.responses.get(command) {
            let mut lines = self.lines.lock().await;
            for line in output.lines() {
                lines.push(line.to_string());
            }
            if *completes {
                lines.push(PROMPT.to_string());
            }
            *self.last_output.lock().unwrap() = Instant::now();
        }
        Ok(())
    }

    async fn read_buffer(&self, last_n: usize) -> Vec<String> {
        let lines = self.lines.lock().await;
        lines.iter().rev().take(last_n).rev().cloned().collect()
    }

    async fn total_lines(&self) -> usize {
        self.lines.lock().await.len()
    }

    async fn lines_from(&self, start: usize) -> Vec<String> {
        let lines = self.lines.lock().await;
        lines.iter().skip(start).cloned().collect()
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
        Ok(())
    }

    fn last_output_age(&self) -> Duration {
        self.last_output.lock().unwrap().elapsed()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config(mode: ExecutionMode) -> Config {
    let mut config = Config::default();
    config.execution_mode = mode;
    config.terminal.command_timeout_secs = 1;
    config
}

fn ctx_for(terminal: Arc<dyn TerminalSession>, config: &Config) -> ToolContext {
    ToolContext {
        terminal,
        terminal_cfg: config.terminal.clone(),
        catalog: shellpilot::i18n::Catalog::new(config.language),
        cancel: CancelToken::new(),
        knowledge: Arc::new(Bm25KnowledgeStore::new()),
        profiles: Arc::new(HostProfileStore::new()),
        host_id: "mock-host".into(),
        plan: Arc::new(Mutex::new(None)),
        mcp: Arc::new(McpRegistry::new()),
        user_io: Arc::new(ScriptedUserIo::new(vec![])),
        user_wake: Arc::new(Notify::new()),
        files: FileAccess::Local,
    }
}

/// Resolve every confirmation the run raises with a fixed decision.
fn auto_resolve(confirmations: Arc<ConfirmationSlot>, approve: bool) {
    tokio::spawn(async move {
        loop {
            if let Some((tool_call_id, _, _)) = confirmations.peek().await {
                let decision = if approve {
                    ConfirmationDecision::approved()
                } else {
                    ConfirmationDecision::rejected()
                };
                confirmations.resolve(&tool_call_id, decision).await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

/// Invariant 1: tool messages pair one-to-one, in order, with the tool
/// calls announced by assistant messages.
fn assert_tool_message_pairing(run: &AgentRun) {
    let announced: Vec<String> = run
        .messages
        .iter()
        .filter(|m| m.role == "assistant")
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|c| c.id.clone())
        .collect();
    let observed: Vec<String> = run
        .messages
        .iter()
        .filter(|m| m.role == "tool")
        .map(|m| m.tool_call_id.clone().expect("tool message without id"))
        .collect();
    assert_eq!(announced, observed, "tool call / observation mismatch");
}

fn tool_outputs(run: &AgentRun) -> Vec<&str> {
    run.messages
        .iter()
        .filter(|m| m.role == "tool")
        .map(|m| m.content.as_str())
        .collect()
}

// ---------------------------------------------------------------------------
// S1 — safe read-only
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_safe_read_only_command_runs_in_strict_mode() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![(
            "df -h",
            "Filesystem      Size  Used Avail Use%\n/dev/sda1        40G   12G   28G  30%",
            true,
        )],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![("execute_command", serde_json::json!({"command": "df -h"}))]),
        Turn::text("Disk usage is healthy: /dev/sda1 is at 30%."),
    ]);
    let config = test_config(ExecutionMode::Strict);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("show disk usage", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.reflection.tool_call_count, 1);
    assert!(run.final_answer.contains("30%"));
    let outputs = tool_outputs(&run);
    assert!(outputs[0].contains("Filesystem"));
    assert!(terminal.all_writes().await.contains("df -h\n"));
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// S2 — dangerous command rejected in strict mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_dangerous_command_denied_then_alternative_proposed() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![(
            "find /var/log -name '*.log' -mtime +30 -delete",
            "",
            true,
        )],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![(
            "execute_command",
            serde_json::json!({"command": "rm -rf /var/log/*"}),
        )]),
        Turn::tools(vec![(
            "execute_command",
            serde_json::json!({"command": "find /var/log -name '*.log' -mtime +30 -delete"}),
        )]),
        Turn::text("Old logs removed with a targeted find instead of rm."),
    ]);
    let config = test_config(ExecutionMode::Strict);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = Arc::new(ConfirmationSlot::new());
    auto_resolve(Arc::clone(&confirmations), false);

    let run = engine.run_task("clean up logs", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    assert!(
        outputs[0].contains("rejected"),
        "first observation should carry the rejection: {}",
        outputs[0]
    );
    // The rejected command never reached the terminal.
    let writes = terminal.all_writes().await;
    assert!(!writes.contains("rm -rf"));
    assert!(writes.contains("find /var/log"));
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// S3 — blocked commands never execute, in any mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s3_blocked_command_never_reaches_terminal_even_in_free_mode() {
    let terminal = Arc::new(ScriptedTerminal::new("t1", vec![]));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![(
            "execute_command",
            serde_json::json!({"command": "mkfs.ext4 /dev/sda1"}),
        )]),
        Turn::text("That command is blocked; I will not format the disk."),
    ]);
    let config = test_config(ExecutionMode::Free);
    let (emitter, events) = ChannelEmitter::new();
    let engine = AgentEngine::new(Arc::new(llm), config.clone()).with_emitter(Arc::new(emitter));
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine
        .run_task("format the disk quickly", &ctx, &confirmations)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    assert!(outputs[0].contains("blocked"));
    // No bytes were written and no confirmation was ever raised.
    assert!(terminal.all_writes().await.is_empty());
    let raised_confirmation = events
        .try_iter()
        .any(|e| matches!(e, EngineEvent::ConfirmationRequested { .. }));
    assert!(!raised_confirmation);
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// S4 — command loop triggers reflection, then a forced stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s4_command_loop_reflects_then_force_stops() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("ps aux", "PID TTY TIME CMD\n1 ? 00:00 init", true)],
    ));
    let ps = || Turn::tools(vec![("execute_command", serde_json::json!({"command": "ps aux"}))]);
    let llm = MockLlm::single(vec![ps(), ps(), ps(), ps(), ps(), ps(), ps(), ps()]);
    let mut config = test_config(ExecutionMode::Free);
    config.engine.max_reflections = 1;
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("watch processes", &ctx, &confirmations).await;

    // A reflection prompt was injected as a user message.
    assert!(
        run.messages
            .iter()
            .any(|m| m.role == "user" && m.content.contains("repeating")),
        "expected a corrective reflection prompt"
    );
    // The model kept looping, so the run was force-stopped with the
    // user-visible message.
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.final_answer.contains("repeating"));
    assert!(run.reflection.reflection_count <= config.engine.max_reflections + 1);
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// S5 — long-running command: still-running hint, wait, status, context
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_long_running_command_uses_wait_and_status() {
    // make produces output but never a fresh prompt, so it times out.
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![(
            "make -j8",
            "gcc -O2 -c main.c\ngcc -O2 -c util.c",
            false,
        )],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![("execute_command", serde_json::json!({"command": "make -j8"}))]),
        Turn::tools(vec![("wait", serde_json::json!({"seconds": 1}))]),
        Turn::tools(vec![("check_terminal_status", serde_json::json!({}))]),
        Turn::tools(vec![("get_terminal_context", serde_json::json!({"lines": 50}))]),
        Turn::text("The build is progressing; two objects compiled so far."),
    ]);
    let config = test_config(ExecutionMode::Free);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("compile project", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    assert!(outputs[0].contains("still running"));
    assert!(outputs[0].contains("wait"));
    assert!(outputs[1].contains("waited 1s"));
    assert!(outputs[2].contains("running"));
    assert!(outputs[3].contains("gcc -O2"));
    // The engine never interrupts on its own.
    assert!(!terminal.all_writes().await.contains('\u{3}'));
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// S6 — orchestrated parallel patrol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_parallel_dispatch_collects_both_workers() {
    let mut config = test_config(ExecutionMode::Free);
    config.hosts = vec![
        HostEntry {
            id: "web-1".into(),
            alias: None,
            kind: HostKind::Local,
            connection: None,
        },
        HostEntry {
            id: "web-2".into(),
            alias: None,
            kind: HostKind::Local,
            connection: None,
        },
    ];

    let llm = MockLlm::new(vec![
        (
            "check load",
            vec![
                Turn::tools(vec![
                    ("connect_terminal", serde_json::json!({"host_id": "web-1"})),
                    ("connect_terminal", serde_json::json!({"host_id": "web-2"})),
                ]),
                Turn::tools(vec![(
                    "parallel_dispatch",
                    serde_json::json!({
                        "terminal_ids": ["term-web-1", "term-web-2"],
                        "task": "run uptime and report"
                    }),
                )]),
                Turn::tools(vec![(
                    "analyze_and_report",
                    serde_json::json!({
                        "severity": "info",
                        "findings": ["web-1 load normal", "web-2 worker failed"],
                        "recommendations": ["re-check web-2"]
                    }),
                )]),
                Turn::text("Patrol finished: one host healthy, one worker needs a re-check."),
            ],
        ),
        (
            "run uptime and report",
            vec![
                Turn::text("load average 0.12, all good"),
                // The second worker's model returns nothing, so that run
                // fails without cancelling its sibling.
                Turn::tools(vec![]),
            ],
        ),
    ]);

    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let orchestrator = Orchestrator::new(
        engine,
        Arc::new(TerminalManager::new()),
        OrchestratorDeps {
            knowledge: Arc::new(Bm25KnowledgeStore::new()),
            profiles: Arc::new(HostProfileStore::new()),
            mcp: Arc::new(McpRegistry::new()),
            user_io: Arc::new(ScriptedUserIo::new(vec![])),
        },
    );

    let run = orchestrator.run("check load on web-1, web-2").await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    // connect_terminal observations carry the terminal ids.
    assert!(outputs[0].contains("term-web-1"));
    assert!(outputs[1].contains("term-web-2"));
    // Parallel results are keyed by terminal id; one worker completed and
    // one failed, and the failure did not cancel the sibling.
    let parallel = outputs[2];
    assert!(parallel.contains("[term-web-1]"));
    assert!(parallel.contains("[term-web-2]"));
    assert!(parallel.contains("completed"));
    assert!(parallel.contains("failed"));
    assert!(parallel.contains("load average 0.12"));
    // The synthesis observation.
    assert!(outputs[3].contains("severity: Info"));
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// SSH completion: quiescence, not prompt detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ssh_command_completes_on_quiescence_without_prompt_trust() {
    let terminal = Arc::new(
        ScriptedTerminal::new("t-ssh", vec![("echo hi", "hi", true)])
            .with_shell_kind(ShellKind::Ssh),
    );
    let llm = MockLlm::single(vec![
        Turn::tools(vec![("execute_command", serde_json::json!({"command": "echo hi"}))]),
        Turn::text("The remote host answered hi."),
    ]);
    let mut config = test_config(ExecutionMode::Free);
    config.terminal.command_timeout_secs = 2;
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("echo over ssh", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    // The quiet remote counts as done; no still-running timeout fires.
    assert!(outputs[0].contains("hi"), "{}", outputs[0]);
    assert!(!outputs[0].contains("still running"), "{}", outputs[0]);
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// Waiting-input ends the poll so the agent can answer the prompt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn password_prompt_returns_promptly_instead_of_timing_out() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("sudo cat /var/log/auth.log", "[sudo] password for ops:", false)],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![(
            "execute_command",
            serde_json::json!({"command": "sudo cat /var/log/auth.log"}),
        )]),
        Turn::text("The command is waiting for the sudo password."),
    ]);
    let config = test_config(ExecutionMode::Free);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let started = Instant::now();
    let run = engine
        .run_task("inspect the auth log", &ctx, &confirmations)
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let outputs = tool_outputs(&run);
    assert!(outputs[0].contains("password"), "{}", outputs[0]);
    assert!(!outputs[0].contains("still running"));
    // First poll already sees the prompt; no one-second timeout burned.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// Confirmation approval path (property 5)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn strict_mode_moderate_command_requires_approved_confirmation() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("cp app.conf app.conf.bak", "", true)],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![(
            "execute_command",
            serde_json::json!({"command": "cp app.conf app.conf.bak"}),
        )]),
        Turn::text("Backup created."),
    ]);
    let config = test_config(ExecutionMode::Strict);
    let (emitter, events) = ChannelEmitter::new();
    let engine = AgentEngine::new(Arc::new(llm), config.clone()).with_emitter(Arc::new(emitter));
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = Arc::new(ConfirmationSlot::new());
    auto_resolve(Arc::clone(&confirmations), true);

    let run = engine.run_task("back up the config", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(terminal.all_writes().await.contains("cp app.conf"));
    let saw_confirmation = events
        .try_iter()
        .any(|e| matches!(e, EngineEvent::ConfirmationRequested { .. }));
    assert!(saw_confirmation, "moderate command must be confirmed in strict mode");
}

#[tokio::test]
async fn relaxed_mode_runs_moderate_without_confirmation() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("cp a b", "", true)],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![("execute_command", serde_json::json!({"command": "cp a b"}))]),
        Turn::text("Copied."),
    ]);
    let config = test_config(ExecutionMode::Relaxed);
    let (emitter, events) = ChannelEmitter::new();
    let engine = AgentEngine::new(Arc::new(llm), config.clone()).with_emitter(Arc::new(emitter));
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("copy a file", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(terminal.all_writes().await.contains("cp a b"));
    assert!(!events
        .try_iter()
        .any(|e| matches!(e, EngineEvent::ConfirmationRequested { .. })));
}

// ---------------------------------------------------------------------------
// Auto-correction surfaces in the observation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_corrected_command_is_narrated_and_rewritten() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("ping -c 4 web-1", "4 packets transmitted, 4 received", true)],
    ));
    let llm = MockLlm::single(vec![
        Turn::tools(vec![("execute_command", serde_json::json!({"command": "ping web-1"}))]),
        Turn::text("web-1 responds to ping."),
    ]);
    let config = test_config(ExecutionMode::Free);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("is web-1 alive?", &ctx, &confirmations).await;

    let outputs = tool_outputs(&run);
    assert!(outputs[0].contains("auto-corrected: ping web-1 -> ping -c 4 web-1"));
    let writes = terminal.all_writes().await;
    assert!(writes.contains("ping -c 4 web-1\n"));
    assert!(!writes.contains("ping web-1\n"));
}

// ---------------------------------------------------------------------------
// Abort (property 8)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_interrupts_wait_within_one_suspension_point() {
    let terminal = Arc::new(ScriptedTerminal::new("t1", vec![]));
    let llm = MockLlm::single(vec![Turn::tools(vec![(
        "wait",
        serde_json::json!({"seconds": 600}),
    )])]);
    let config = test_config(ExecutionMode::Free);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let run = engine.run_task("wait forever", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_tool_message_pairing(&run);
}

#[tokio::test]
async fn abort_rejects_pending_confirmation() {
    let terminal = Arc::new(ScriptedTerminal::new("t1", vec![]));
    let llm = MockLlm::single(vec![Turn::tools(vec![(
        "execute_command",
        serde_json::json!({"command": "systemctl restart nginx"}),
    )])]);
    let config = test_config(ExecutionMode::Strict);
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = Arc::new(ConfirmationSlot::new());

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    // Nobody resolves the confirmation; abort must unblock the engine.
    let run = engine.run_task("restart nginx", &ctx, &confirmations).await;
    assert_eq!(run.status, RunStatus::Aborted);
    assert!(terminal.all_writes().await.is_empty());
    assert_tool_message_pairing(&run);
}

// ---------------------------------------------------------------------------
// Tool call hard cap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_call_cap_fails_the_run() {
    let terminal = Arc::new(ScriptedTerminal::new(
        "t1",
        vec![("uptime", "up 3 days", true)],
    ));
    // Endless distinct-enough turns alternating two commands would dodge
    // loop detection only briefly; use distinct wait args to stay clean of
    // reflection and hit the cap itself.
    let mut turns = Vec::new();
    for i in 0..20 {
        turns.push(Turn::tools(vec![(
            "get_terminal_context",
            serde_json::json!({"lines": 10 + i}),
        )]));
    }
    let llm = MockLlm::single(turns);
    let mut config = test_config(ExecutionMode::Free);
    config.engine.max_tool_calls = 5;
    config.validate().unwrap();
    let engine = AgentEngine::new(Arc::new(llm), config.clone());
    let ctx = ctx_for(terminal.clone(), &config);
    let confirmations = ConfirmationSlot::new();

    let run = engine.run_task("poke around", &ctx, &confirmations).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error.as_deref(), Some("tool call limit exceeded"));
    assert!(run.reflection.tool_call_count <= 6);
}
