//! Terminal-facing tools: command execution, state inspection, raw input.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{parse_args, Tool, ToolContext, ToolResult};
use crate::config::TerminalConfig;
use crate::engine::cancel::CancelToken;
use crate::i18n::Catalog;
use crate::safety::RiskLevel;
use crate::terminal::{awareness, control_bytes, ShellKind, TerminalSession};

/// Longest observation returned to the model from one command.
const MAX_OUTPUT_CHARS: usize = 10_000;

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let tail: String = output
        .chars()
        .rev()
        .take(MAX_OUTPUT_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("[... output truncated ...]\n{}", tail)
}

fn classify_now(terminal: &dyn TerminalSession, cfg: &TerminalConfig, lines: &[String]) -> awareness::TerminalState {
    awareness::classify(
        lines,
        terminal.shell_kind(),
        terminal.last_output_age(),
        Duration::from_secs(cfg.stuck_after_secs),
    )
}

/// Completion signal for one poll of `execute_command`.
///
/// A fresh prompt (Idle) or an input request (the command is waiting on
/// the agent) ends the poll. SSH sessions never report Idle, so a remote
/// that has been silent for the quiescence window counts as done.
fn command_finished(
    state: &awareness::TerminalState,
    terminal: &dyn TerminalSession,
    quiescence: Duration,
) -> bool {
    if state.is_idle() || state.activity == awareness::TerminalActivity::WaitingInput {
        return true;
    }
    terminal.shell_kind() == ShellKind::Ssh && terminal.last_output_age() >= quiescence
}

/// Run a shell command in the bound terminal and poll for completion.
pub struct ExecuteCommand {
    terminal: Arc<dyn TerminalSession>,
    cfg: TerminalConfig,
    catalog: Catalog,
    cancel: CancelToken,
}

impl ExecuteCommand {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            terminal: Arc::clone(&ctx.terminal),
            cfg: ctx.terminal_cfg.clone(),
            catalog: ctx.catalog,
            cancel: ctx.cancel.clone(),
        }
    }
}

#[async_trait]
impl Tool for ExecuteCommand {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the terminal and return its output. Long-running commands return a still-running hint instead of blocking."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command to execute"},
                "timeout_sec": {"type": "integer", "minimum": 1, "description": "Seconds to wait for completion (default 30)"}
            },
            "required": ["command"]
        })
    }

    fn risk(&self, _args: &Value) -> RiskLevel {
        // Real classification happens in the engine's risk gate, which
        // sees the command string and the execution mode.
        RiskLevel::Moderate
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            command: String,
            timeout_sec: Option<u64>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        if args.command.trim().is_empty() {
            return Ok(ToolResult::fail("empty command"));
        }
        let timeout = Duration::from_secs(
            args.timeout_sec
                .unwrap_or(self.cfg.command_timeout_secs)
                .max(1),
        );

        // State gate: never queue bytes behind a busy foreground command.
        let snapshot = self.terminal.read_buffer(self.cfg.context_lines).await;
        let state = classify_now(self.terminal.as_ref(), &self.cfg, &snapshot);
        if !state.can_execute() && self.terminal.shell_kind() != ShellKind::Ssh {
            return Ok(ToolResult::fail(self.catalog.terminal_busy_hint())
                .with_metadata("terminal_state", serde_json::to_value(&state)?));
        }

        let start_line = self.terminal.total_lines().await;
        self.terminal
            .write(format!("{}\n", args.command).as_bytes())
            .await?;

        // Adaptive polling: fast at first, backing off to 1s.
        let started = Instant::now();
        let mut interval = Duration::from_millis(300);
        // SSH sessions never classify Idle from prompt heuristics, so a
        // quiet remote that has produced output counts as done instead.
        let quiescence = Duration::from_millis(750).min(timeout / 2).max(interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(ToolResult::fail(self.catalog.aborted_message()));
                }
                _ = tokio::time::sleep(interval) => {}
            }
            interval = (interval * 3 / 2).min(Duration::from_secs(1));

            let new_lines = self.terminal.lines_from(start_line).await;
            let state = classify_now(self.terminal.as_ref(), &self.cfg, &new_lines);
            if !new_lines.is_empty() && command_finished(&state, self.terminal.as_ref(), quiescence)
            {
                let output = truncate_output(&new_lines.join("\n"));
                return Ok(ToolResult::ok(output)
                    .with_metadata("state", serde_json::to_value(&state)?));
            }

            if started.elapsed() >= timeout {
                let partial = truncate_output(&new_lines.join("\n"));
                return Ok(ToolResult::fail_with_hint(
                    format!(
                        "command still running after {}s; partial output:\n{}",
                        timeout.as_secs(),
                        partial
                    ),
                    self.catalog.still_running_hint(),
                )
                .with_metadata("still_running", Value::Bool(true)));
            }
        }
    }
}

/// Read-only classification of the terminal's current state.
pub struct CheckTerminalStatus {
    terminal: Arc<dyn TerminalSession>,
    cfg: TerminalConfig,
}

impl CheckTerminalStatus {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            terminal: Arc::clone(&ctx.terminal),
            cfg: ctx.terminal_cfg.clone(),
        }
    }
}

#[async_trait]
impl Tool for CheckTerminalStatus {
    fn name(&self) -> &str {
        "check_terminal_status"
    }

    fn description(&self) -> &str {
        "Classify the terminal's current state: idle, running, waiting for input, or possibly stuck."
    }

    fn schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> Result<ToolResult> {
        let snapshot = self.terminal.read_buffer(self.cfg.context_lines).await;
        let state = classify_now(self.terminal.as_ref(), &self.cfg, &snapshot);
        Ok(ToolResult::ok(serde_json::to_string_pretty(&state)?))
    }
}

/// Read the last N lines of terminal output.
pub struct GetTerminalContext {
    terminal: Arc<dyn TerminalSession>,
    cfg: TerminalConfig,
}

impl GetTerminalContext {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            terminal: Arc::clone(&ctx.terminal),
            cfg: ctx.terminal_cfg.clone(),
        }
    }
}

#[async_trait]
impl Tool for GetTerminalContext {
    fn name(&self) -> &str {
        "get_terminal_context"
    }

    fn description(&self) -> &str {
        "Read the last N lines of visible terminal output."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "lines": {"type": "integer", "minimum": 1, "maximum": 1000, "description": "How many trailing lines to read"}
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            lines: Option<usize>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        let n = args.lines.unwrap_or(self.cfg.context_lines).clamp(1, 1000);
        let lines = self.terminal.read_buffer(n).await;
        let cleaned: Vec<String> = lines.iter().map(|l| awareness::strip_ansi(l)).collect();
        Ok(ToolResult::ok(truncate_output(&cleaned.join("\n"))))
    }
}

/// Send a named control key (ctrl+c, enter, arrows) to the terminal.
pub struct SendControlKey {
    terminal: Arc<dyn TerminalSession>,
}

impl SendControlKey {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            terminal: Arc::clone(&ctx.terminal),
        }
    }
}

#[async_trait]
impl Tool for SendControlKey {
    fn name(&self) -> &str {
        "send_control_key"
    }

    fn description(&self) -> &str {
        "Send a control key to the terminal: ctrl+c, ctrl+d, ctrl+z, enter, tab, esc, or an arrow key."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Key name, e.g. ctrl+c, enter, up"}
            },
            "required": ["key"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            key: String,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        let Some(bytes) = control_bytes(&args.key) else {
            return Ok(ToolResult::fail(format!("unknown control key: {}", args.key)));
        };
        self.terminal.write(bytes).await?;
        Ok(ToolResult::ok(format!("sent {}", args.key)))
    }
}

/// Type text into the terminal, e.g. to answer an interactive prompt.
pub struct SendInput {
    terminal: Arc<dyn TerminalSession>,
}

impl SendInput {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            terminal: Arc::clone(&ctx.terminal),
        }
    }
}

#[async_trait]
impl Tool for SendInput {
    fn name(&self) -> &str {
        "send_input"
    }

    fn description(&self) -> &str {
        "Type text into the terminal, for answering prompts. Set submit=false to type without pressing enter."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "maxLength": 1000},
                "submit": {"type": "boolean", "default": true}
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            text: String,
            #[serde(default = "default_submit")]
            submit: bool,
        }
        fn default_submit() -> bool {
            true
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        if args.text.chars().count() > 1000 {
            return Ok(ToolResult::fail("input exceeds 1000 characters"));
        }
        let payload = if args.submit {
            format!("{}\n", args.text)
        } else {
            args.text.clone()
        };
        self.terminal.write(payload.as_bytes()).await?;
        Ok(ToolResult::ok(format!("typed {} characters", args.text.chars().count())))
    }
}
