//! Tool catalog and dispatch.
//!
//! Each tool is a distinct type carrying its schema and handler; dispatch
//! is a name lookup plus schema-validated argument decoding. Failures
//! never escape the executor as errors: they ride inside [`ToolResult`]
//! with a classified kind and a recovery hint so the model can choose its
//! own way out.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod file;
pub mod interact;
pub mod knowledge;
pub mod mcp_proxy;
pub mod plan;
pub mod terminal;

use crate::api::types::{FunctionDefinition, ToolDefinition};
use crate::config::TerminalConfig;
use crate::engine::cancel::CancelToken;
use crate::i18n::Catalog;
use crate::knowledge::{HostProfileStore, KnowledgeStore};
use crate::mcp::McpRegistry;
use crate::planner::TaskPlan;
use crate::safety::RiskLevel;
use crate::terminal::TerminalSession;

/// Typed result of one tool execution. `output` is what the LLM sees next
/// turn; `error` is retained for reflection accounting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: format!("Error: {}", error),
            error: Some(error),
            metadata: None,
        }
    }

    pub fn fail_with_hint(error: impl Into<String>, hint: &str) -> Self {
        let error = format!("{} ({})", error.into(), hint);
        Self {
            success: false,
            output: format!("Error: {}", error),
            error: Some(error),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
        self
    }

    /// The observation string appended as the tool message.
    pub fn render(&self) -> String {
        self.output.clone()
    }
}

/// A tool the agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;

    /// Static risk class of a call with these arguments. Command risk for
    /// `execute_command` is assessed separately by the engine's gate.
    fn risk(&self, _args: &Value) -> RiskLevel {
        RiskLevel::Safe
    }

    async fn execute(&self, args: Value) -> Result<ToolResult>;
}

/// Decode tool arguments, mapping malformed input to a failed ToolResult
/// (no side effects, not retried automatically).
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    args: Value,
) -> std::result::Result<T, Box<ToolResult>> {
    serde_json::from_value(args)
        .map_err(|e| Box::new(ToolResult::fail(format!("argument parse failed: {}", e))))
}

/// Error kinds used to attach recovery hints to failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Permission,
    NotFound,
    Timeout,
    Transient,
    Syntax,
    Other,
}

/// Classify an error message by its text. Best effort: unknown shapes
/// fall through to `Other` with no hint.
pub fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        ErrorKind::Permission
    } else if lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("unknown host")
    {
        ErrorKind::NotFound
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::Timeout
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("temporarily unavailable")
        || lower.contains("try again")
    {
        ErrorKind::Transient
    } else if lower.contains("syntax error")
        || lower.contains("command not found")
        || lower.contains("invalid option")
        || lower.contains("usage:")
    {
        ErrorKind::Syntax
    } else {
        ErrorKind::Other
    }
}

pub fn recovery_hint(kind: ErrorKind, catalog: &Catalog) -> Option<&'static str> {
    match kind {
        ErrorKind::Permission => Some(catalog.hint_permission()),
        ErrorKind::NotFound => Some(catalog.hint_not_found()),
        ErrorKind::Timeout => Some(catalog.hint_timeout()),
        ErrorKind::Transient => Some(catalog.hint_transient()),
        ErrorKind::Syntax => Some(catalog.hint_syntax()),
        ErrorKind::Other => None,
    }
}

/// Shared plan slot: the engine and the plan tools mutate the same plan.
pub type PlanSlot = Arc<Mutex<Option<TaskPlan>>>;

/// Everything the built-in tools need, bound to one run and one terminal.
#[derive(Clone)]
pub struct ToolContext {
    pub terminal: Arc<dyn TerminalSession>,
    pub terminal_cfg: TerminalConfig,
    pub catalog: Catalog,
    pub cancel: CancelToken,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub profiles: Arc<HostProfileStore>,
    pub host_id: String,
    pub plan: PlanSlot,
    pub mcp: Arc<McpRegistry>,
    pub user_io: Arc<dyn interact::UserIo>,
    /// Notified when the operator sends a message mid-run; wakes `wait`.
    pub user_wake: Arc<tokio::sync::Notify>,
    pub files: file::FileAccess,
}

/// Name-keyed registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the canonical tool set bound to `ctx`, plus one proxy
    /// per connected MCP server tool.
    pub async fn for_run(ctx: &ToolContext) -> Self {
        let mut registry = Self::empty();

        registry.register(terminal::ExecuteCommand::new(ctx));
        registry.register(terminal::CheckTerminalStatus::new(ctx));
        registry.register(terminal::GetTerminalContext::new(ctx));
        registry.register(terminal::SendControlKey::new(ctx));
        registry.register(terminal::SendInput::new(ctx));

        registry.register(file::ReadFile::new(ctx));
        registry.register(file::WriteFile::new(ctx));

        registry.register(interact::WaitTool::new(ctx));
        registry.register(interact::AskUser::new(ctx));

        registry.register(knowledge::RememberInfo::new(ctx));
        registry.register(knowledge::SearchKnowledge::new(ctx));

        registry.register(plan::CreatePlan::new(ctx));
        registry.register(plan::UpdatePlan::new(ctx));

        for server_id in ctx.mcp.list_connected_servers().await {
            match ctx.mcp.list_tools(&server_id).await {
                Ok(tools) => {
                    for info in tools {
                        registry.register(mcp_proxy::McpProxyTool::new(
                            Arc::clone(&ctx.mcp),
                            &server_id,
                            info,
                        ));
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %server_id, "MCP tool discovery failed: {}", e);
                }
            }
        }

        registry
    }

    /// Register a tool, replacing any existing tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name. Never returns an error: unknown tools,
    /// malformed arguments, and handler failures all come back as failed
    /// ToolResults with recovery hints.
    pub async fn execute(&self, name: &str, args: Value, catalog: &Catalog) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::fail(format!("unknown tool: {}", name));
        };
        match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                match recovery_hint(classify_error(&message), catalog) {
                    Some(hint) => ToolResult::fail_with_hint(message, hint),
                    None => ToolResult::fail(message),
                }
            }
        }
    }

    /// API-facing tool definitions, sorted by name for stable prompts.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                def_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.schema(),
                },
            })
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }
}
