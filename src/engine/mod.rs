//! The agent execution engine: a ReAct loop over a streaming LLM.
//!
//! One iteration streams an assistant turn, dispatches its tool calls in
//! submission order under the risk and terminal-state gates, appends the
//! observations, lets reflection inspect the history, and continues until
//! the model answers in plain text or a terminal condition fires.
//!
//! The engine owns all mutable run state; the planner and reflection
//! tracker are plain data it borrows into each step, so no back-edges
//! exist between the three. The orchestrator reuses the same loop with
//! its own tool catalog via [`AgentEngine::run_with_registry`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod cancel;
pub mod confirmation;
pub mod events;

use crate::api::types::{Message, ToolCall, ToolDefinition};
use crate::api::{LlmClient, StreamChunk};
use crate::config::{Config, ExecutionMode, TerminalConfig};
use crate::history::{RunHistoryStore, RunRecord};
use crate::i18n::Catalog;
use crate::prompt::{PromptBuilder, PromptInput};
use crate::reflection::{ReflectionLimits, ReflectionState};
use crate::safety::{AutoCorrection, RiskAssessor, RiskLevel};
use crate::terminal::TerminalSession;
use crate::tools::{PlanSlot, ToolContext, ToolRegistry, ToolResult};
use cancel::CancelToken;
use confirmation::{ConfirmationDecision, ConfirmationSlot};
use events::{EngineEvent, EventEmitter, NoopEmitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// All state owned by one task execution.
pub struct AgentRun {
    pub id: String,
    pub task: String,
    pub messages: Vec<Message>,
    pub reflection: ReflectionState,
    pub status: RunStatus,
    pub final_answer: String,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    fn new(task: &str) -> Self {
        Self {
            id: format!("run_{}", uuid::Uuid::new_v4()),
            task: task.to_string(),
            messages: Vec::new(),
            reflection: ReflectionState::new(),
            status: RunStatus::Running,
            final_answer: String::new(),
            last_error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Outcome of the pre-execution gate for one tool call.
enum Gate {
    /// Refused outright; the result is appended without executing.
    Deny(ToolResult),
    /// Cleared to run, possibly rewritten, possibly behind confirmation.
    Allow {
        args: Value,
        risk: RiskLevel,
        correction_note: Option<String>,
    },
}

/// Everything one loop invocation needs besides the engine itself.
struct RunParams<'a> {
    registry: &'a ToolRegistry,
    cancel: &'a CancelToken,
    confirmations: &'a ConfirmationSlot,
    plan: PlanSlot,
    /// The bound terminal, when this run drives one; used by the dynamic
    /// ctrl+c risk gate.
    terminal: Option<(Arc<dyn TerminalSession>, TerminalConfig)>,
}

/// The ReAct execution engine. Cheap to clone; the orchestrator clones
/// one per worker.
#[derive(Clone)]
pub struct AgentEngine {
    client: Arc<dyn LlmClient>,
    config: Config,
    catalog: Catalog,
    assessor: RiskAssessor,
    emitter: Arc<dyn EventEmitter>,
    history: Option<Arc<RunHistoryStore>>,
}

impl AgentEngine {
    pub fn new(client: Arc<dyn LlmClient>, config: Config) -> Self {
        let catalog = Catalog::new(config.language);
        Self {
            client,
            config,
            catalog,
            assessor: RiskAssessor::new(),
            emitter: Arc::new(NoopEmitter),
            history: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_history(mut self, history: Arc<RunHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one task to completion against the terminal bound in `ctx`.
    ///
    /// `confirmations` is the per-run slot a frontend resolves; the engine
    /// suspends on it whenever the execution mode demands approval.
    pub async fn run_task(
        &self,
        task: &str,
        ctx: &ToolContext,
        confirmations: &ConfirmationSlot,
    ) -> AgentRun {
        let registry = ToolRegistry::for_run(ctx).await;
        let system_prompt = self.build_system_prompt(task, ctx, &registry).await;
        let params = RunParams {
            registry: &registry,
            cancel: &ctx.cancel,
            confirmations,
            plan: ctx.plan.clone(),
            terminal: Some((Arc::clone(&ctx.terminal), ctx.terminal_cfg.clone())),
        };
        self.run_loop(task, system_prompt, params).await
    }

    /// Execute a task with a caller-supplied tool catalog and prompt; the
    /// orchestrator's master loop enters here.
    pub async fn run_with_registry(
        &self,
        task: &str,
        system_prompt: String,
        registry: &ToolRegistry,
        cancel: &CancelToken,
        confirmations: &ConfirmationSlot,
    ) -> AgentRun {
        let params = RunParams {
            registry,
            cancel,
            confirmations,
            plan: Arc::new(Mutex::new(None)),
            terminal: None,
        };
        self.run_loop(task, system_prompt, params).await
    }

    async fn run_loop(&self, task: &str, system_prompt: String, params: RunParams<'_>) -> AgentRun {
        let mut run = AgentRun::new(task);
        info!(run_id = %run.id, task, "starting agent run");

        run.messages.push(Message::system(system_prompt));
        run.messages.push(Message::user(task));

        let limits = ReflectionLimits {
            warn_steps: 40usize.min(self.config.engine.max_tool_calls),
            max_reflections: self.config.engine.max_reflections,
            min_interval: self.config.engine.reflection_interval,
        };
        let deadline = Instant::now() + Duration::from_secs(self.config.engine.run_timeout_secs);
        let definitions = params.registry.definitions();

        while run.status == RunStatus::Running {
            if params.cancel.is_cancelled() {
                self.finish(&mut run, RunStatus::Aborted, self.catalog.aborted_message());
                break;
            }
            if Instant::now() >= deadline {
                run.last_error = Some("run timeout".to_string());
                self.finish(&mut run, RunStatus::Failed, self.catalog.run_timeout_message());
                break;
            }

            let turn = self
                .stream_turn(&run, definitions.clone(), params.cancel)
                .await;
            let (content, tool_calls) = match turn {
                TurnOutcome::Aborted => {
                    self.finish(&mut run, RunStatus::Aborted, self.catalog.aborted_message());
                    break;
                }
                TurnOutcome::StreamError(e) => {
                    warn!(run_id = %run.id, "LLM stream failed: {}", e);
                    run.last_error = Some(e.clone());
                    run.messages
                        .push(Message::system(format!("run stopped: LLM stream failed: {}", e)));
                    self.finish(&mut run, RunStatus::Failed, String::new());
                    break;
                }
                TurnOutcome::Turn { content, tool_calls } => (content, tool_calls),
            };

            if tool_calls.is_empty() {
                if content.trim().is_empty() {
                    run.last_error = Some("model returned an empty response".to_string());
                    self.finish(&mut run, RunStatus::Failed, String::new());
                } else {
                    run.messages.push(Message::assistant(content.clone()));
                    self.finish(&mut run, RunStatus::Completed, content);
                }
                break;
            }

            run.messages
                .push(Message::assistant_with_tools(content, tool_calls.clone()));

            let mut aborted_mid_batch = false;
            for call in &tool_calls {
                if aborted_mid_batch || params.cancel.is_cancelled() {
                    // Pair every announced call with an observation so the
                    // transcript stays well-formed.
                    run.messages.push(Message::tool(
                        ToolResult::fail(self.catalog.aborted_message()).render(),
                        &call.id,
                    ));
                    aborted_mid_batch = true;
                    continue;
                }
                let result = self.dispatch_tool_call(&run, call, &params).await;
                let result = match result {
                    DispatchOutcome::Result(r) => r,
                    DispatchOutcome::Aborted => {
                        run.messages.push(Message::tool(
                            ToolResult::fail(self.catalog.aborted_message()).render(),
                            &call.id,
                        ));
                        aborted_mid_batch = true;
                        continue;
                    }
                };

                self.emitter.emit(EngineEvent::ToolFinished {
                    run_id: run.id.clone(),
                    tool_name: call.function.name.clone(),
                    success: result.success,
                });
                if let Some(err) = &result.error {
                    run.last_error = Some(err.clone());
                }

                let command = command_of(call);
                run.reflection.record(
                    &call.function.name,
                    &call.function.arguments,
                    command.as_deref(),
                    result.success,
                );
                run.messages.push(Message::tool(result.render(), &call.id));
            }

            if aborted_mid_batch {
                self.finish(&mut run, RunStatus::Aborted, self.catalog.aborted_message());
                break;
            }

            // Reflection pass between tool batches.
            if run.reflection.should_trigger_reflection(&limits) {
                match run.reflection.generate_reflection_prompt(&limits, &self.catalog) {
                    Some(prompt) => {
                        let issues = run.reflection.detected_issues.clone();
                        debug!(run_id = %run.id, ?issues, "injecting reflection prompt");
                        run.messages.push(Message::user(prompt));
                        run.reflection.note_reflection();
                        self.emitter.emit(EngineEvent::ReflectionInjected {
                            run_id: run.id.clone(),
                            issues,
                        });
                    }
                    None => {
                        run.reflection.note_reflection();
                        self.finish(
                            &mut run,
                            RunStatus::Completed,
                            self.catalog.loop_stop_message(),
                        );
                        break;
                    }
                }
            }

            if let Some((strategy, reason)) = run.reflection.should_switch_strategy(&limits) {
                info!(run_id = %run.id, %strategy, %reason, "switching strategy");
                run.reflection.switch_strategy(strategy, reason.clone());
                if let Some(plan) = params.plan.lock().await.as_mut() {
                    plan.change_strategy(strategy, &reason);
                }
                self.emitter.emit(EngineEvent::StrategySwitched {
                    run_id: run.id.clone(),
                    to: strategy.to_string(),
                });
            }

            if run.reflection.tool_call_count > self.config.engine.max_tool_calls {
                run.last_error = Some("tool call limit exceeded".to_string());
                self.finish(&mut run, RunStatus::Failed, self.catalog.tool_cap_message());
                break;
            }
        }

        self.record_history(&run, &params.plan).await;
        run
    }

    async fn build_system_prompt(
        &self,
        task: &str,
        ctx: &ToolContext,
        registry: &ToolRegistry,
    ) -> String {
        let profile = ctx.profiles.get(&ctx.host_id).await;
        let memories = ctx
            .knowledge
            .host_memories_for_prompt(&ctx.host_id, task, 5)
            .await;
        let plan_summary = ctx.plan.lock().await.as_ref().map(|p| p.summary());
        let definitions = registry.definitions();
        let builder = PromptBuilder::new(self.config.engine.prompt_token_budget);
        builder.build_system_prompt(&PromptInput {
            mbti: self.config.persona.mbti.as_deref(),
            rules: &self.config.rules,
            language: self.config.language,
            host_id: &ctx.host_id,
            profile: &profile,
            shell_kind: ctx.terminal.shell_kind(),
            memories,
            plan_summary,
            tools: &definitions,
        })
    }

    /// Stream one assistant turn, accumulating visible text and tool
    /// calls, racing the run's cancel token.
    async fn stream_turn(
        &self,
        run: &AgentRun,
        tools: Vec<ToolDefinition>,
        cancel: &CancelToken,
    ) -> TurnOutcome {
        let mut rx = match self
            .client
            .chat_stream(run.messages.clone(), Some(tools))
            .await
        {
            Ok(rx) => rx,
            Err(e) => return TurnOutcome::StreamError(e.to_string()),
        };

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return TurnOutcome::Aborted,
                chunk = rx.recv() => chunk,
            };
            match chunk {
                Some(Ok(StreamChunk::Content(text))) => {
                    self.emitter.emit(EngineEvent::TextDelta {
                        run_id: run.id.clone(),
                        text: text.clone(),
                    });
                    content.push_str(&text);
                }
                Some(Ok(StreamChunk::ToolCall(call))) => tool_calls.push(call),
                Some(Ok(StreamChunk::Usage(_))) => {}
                Some(Ok(StreamChunk::Done)) | None => break,
                Some(Err(e)) => return TurnOutcome::StreamError(e.to_string()),
            }
        }
        TurnOutcome::Turn { content, tool_calls }
    }

    /// Gate and execute one tool call.
    async fn dispatch_tool_call(
        &self,
        run: &AgentRun,
        call: &ToolCall,
        params: &RunParams<'_>,
    ) -> DispatchOutcome {
        let name = &call.function.name;
        self.emitter.emit(EngineEvent::ToolStarted {
            run_id: run.id.clone(),
            tool_name: name.clone(),
            args_preview: preview(&call.function.arguments),
        });

        let args: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                return DispatchOutcome::Result(ToolResult::fail(format!(
                    "argument parse failed: {}",
                    e
                )))
            }
        };

        let gate = self.gate(name, args, params).await;
        let (mut args, risk, correction_note) = match gate {
            Gate::Deny(result) => return DispatchOutcome::Result(result),
            Gate::Allow {
                args,
                risk,
                correction_note,
            } => (args, risk, correction_note),
        };

        if self.needs_confirmation(risk) {
            let command = args
                .get("command")
                .and_then(|c| c.as_str())
                .unwrap_or(name)
                .to_string();
            let rx = match params
                .confirmations
                .raise(&run.id, &call.id, name, args.clone(), risk)
                .await
            {
                Ok(rx) => rx,
                Err(e) => return DispatchOutcome::Result(ToolResult::fail(e.to_string())),
            };
            self.emitter.emit(EngineEvent::ConfirmationRequested {
                run_id: run.id.clone(),
                tool_call_id: call.id.clone(),
                command: command.clone(),
                risk,
            });

            let decision = tokio::select! {
                _ = params.cancel.cancelled() => {
                    params.confirmations.reject_pending().await;
                    return DispatchOutcome::Aborted;
                }
                decision = rx => decision,
            };
            params.confirmations.clear().await;
            match decision {
                Ok(ConfirmationDecision {
                    approved: true,
                    modified_args,
                }) => {
                    if let Some(edited) = modified_args {
                        args = edited;
                    }
                }
                Ok(ConfirmationDecision { approved: false, .. }) => {
                    return DispatchOutcome::Result(ToolResult::fail(format!(
                        "{}: {}",
                        self.catalog.user_rejected(),
                        command
                    )));
                }
                Err(_) => {
                    return DispatchOutcome::Result(ToolResult::fail(
                        self.catalog.confirmation_timeout(),
                    ));
                }
            }
        }

        let mut result = params.registry.execute(name, args, &self.catalog).await;
        // Surface a command rewrite in the observation so the model
        // narrates it to the user.
        if let Some(note) = correction_note {
            result.output = format!("[{}]\n{}", note, result.output);
        }
        DispatchOutcome::Result(result)
    }

    /// Risk gate. Ordering matters: for `execute_command`, the assessor
    /// runs here, before any possibility of terminal writes.
    async fn gate(&self, name: &str, mut args: Value, params: &RunParams<'_>) -> Gate {
        if name == "execute_command" {
            let command = args
                .get("command")
                .and_then(|c| c.as_str())
                .unwrap_or("")
                .to_string();
            let assessed = match self.assessor.assess(&command) {
                Ok(a) => a,
                Err(e) => return Gate::Deny(ToolResult::fail(e.to_string())),
            };
            if assessed.level == RiskLevel::Blocked {
                return Gate::Deny(ToolResult::fail(format!(
                    "{}: {}",
                    self.catalog.command_blocked(),
                    assessed.reason.unwrap_or("blocked pattern")
                )));
            }

            let mut correction_note = None;
            if self.config.terminal.auto_correct_commands {
                match self.assessor.auto_correct(&command) {
                    Some(AutoCorrection::Rewrite { corrected, note }) => {
                        correction_note =
                            Some(format!("auto-corrected: {} -> {} ({})", command, corrected, note));
                        args["command"] = Value::String(corrected);
                    }
                    Some(AutoCorrection::Reject { reason }) => {
                        return Gate::Deny(ToolResult::fail(reason));
                    }
                    None => {}
                }
            }
            return Gate::Allow {
                args,
                risk: assessed.level,
                correction_note,
            };
        }

        if name == "send_control_key" {
            let key = args.get("key").and_then(|k| k.as_str()).unwrap_or("");
            let mut risk = RiskLevel::Safe;
            if key.eq_ignore_ascii_case("ctrl+c") {
                // Interrupting a live command is dangerous; an idle ctrl+c
                // is harmless.
                if let Some((terminal, cfg)) = &params.terminal {
                    let snapshot = terminal.read_buffer(cfg.context_lines).await;
                    let state = crate::terminal::awareness::classify(
                        &snapshot,
                        terminal.shell_kind(),
                        terminal.last_output_age(),
                        Duration::from_secs(cfg.stuck_after_secs),
                    );
                    if !state.is_idle() {
                        risk = RiskLevel::Dangerous;
                    }
                }
            }
            return Gate::Allow {
                args,
                risk,
                correction_note: None,
            };
        }

        let risk = params
            .registry
            .get(name)
            .map(|t| t.risk(&args))
            .unwrap_or(RiskLevel::Safe);
        Gate::Allow {
            args,
            risk,
            correction_note: None,
        }
    }

    fn needs_confirmation(&self, risk: RiskLevel) -> bool {
        match self.config.execution_mode {
            ExecutionMode::Strict => risk >= RiskLevel::Moderate,
            ExecutionMode::Relaxed => risk >= RiskLevel::Dangerous,
            ExecutionMode::Free => false,
        }
    }

    fn finish(&self, run: &mut AgentRun, status: RunStatus, answer: impl Into<String>) {
        run.status = status;
        run.final_answer = answer.into();
        run.ended_at = Some(Utc::now());
        info!(run_id = %run.id, %status, "run finished");
        self.emitter.emit(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            status: status.to_string(),
            answer: run.final_answer.clone(),
        });
    }

    async fn record_history(&self, run: &AgentRun, plan: &PlanSlot) {
        let Some(history) = &self.history else {
            return;
        };
        let record = RunRecord {
            run_id: run.id.clone(),
            task: run.task.clone(),
            messages: run.messages.clone(),
            steps: run.reflection.tool_call_count,
            plan: plan.lock().await.clone(),
            status: run.status.to_string(),
            started_at: run.started_at,
            ended_at: run.ended_at,
        };
        if let Err(e) = history.append(&record).await {
            warn!(run_id = %run.id, "failed to append run history: {}", e);
        }
    }
}

enum TurnOutcome {
    Turn {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    Aborted,
    StreamError(String),
}

enum DispatchOutcome {
    Result(ToolResult),
    Aborted,
}

fn command_of(call: &ToolCall) -> Option<String> {
    if call.function.name != "execute_command" {
        return None;
    }
    let args: Value = serde_json::from_str(&call.function.arguments).ok()?;
    args.get("command")?.as_str().map(String::from)
}

fn preview(args: &str) -> String {
    const MAX: usize = 120;
    if args.chars().count() <= MAX {
        args.to_string()
    } else {
        format!("{}...", args.chars().take(MAX).collect::<String>())
    }
}
