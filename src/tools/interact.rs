//! Interaction tools: cooperative waiting and operator questions.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{parse_args, Tool, ToolContext, ToolResult};
use crate::engine::cancel::CancelToken;
use crate::i18n::Catalog;

/// How long `ask_user` waits before giving up with a default answer.
const ASK_USER_TIMEOUT: Duration = Duration::from_secs(300);

/// Channel to the human operator.
#[async_trait]
pub trait UserIo: Send + Sync {
    /// Pose a question; None means no answer arrived.
    async fn ask(&self, question: &str) -> Option<String>;
}

/// Reads answers from stdin; for the CLI frontend.
pub struct StdinUserIo;

#[async_trait]
impl UserIo for StdinUserIo {
    async fn ask(&self, question: &str) -> Option<String> {
        use std::io::Write;
        println!("\n? {}", question);
        print!("> ");
        std::io::stdout().flush().ok();
        // Blocking stdin read moved off the runtime.
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok()?;
            Some(line.trim().to_string())
        })
        .await
        .ok()
        .flatten()
    }
}

/// Scripted answers for tests; answers are handed out in order, then None.
pub struct ScriptedUserIo {
    answers: tokio::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedUserIo {
    pub fn new(answers: Vec<String>) -> Self {
        Self {
            answers: tokio::sync::Mutex::new(answers.into()),
        }
    }
}

#[async_trait]
impl UserIo for ScriptedUserIo {
    async fn ask(&self, _question: &str) -> Option<String> {
        self.answers.lock().await.pop_front()
    }
}

/// Cooperative sleep. Wakes early if the run is aborted or the operator
/// sends a new message.
pub struct WaitTool {
    cancel: CancelToken,
    user_wake: Arc<Notify>,
    catalog: Catalog,
}

impl WaitTool {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            cancel: ctx.cancel.clone(),
            user_wake: Arc::clone(&ctx.user_wake),
            catalog: ctx.catalog,
        }
    }
}

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Sleep for a number of seconds, e.g. while a long command runs. Wakes early on a new user message."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "seconds": {"type": "integer", "minimum": 1, "maximum": 600}
            },
            "required": ["seconds"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            seconds: u64,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        if args.seconds < 1 {
            return Ok(ToolResult::fail("seconds must be at least 1"));
        }
        let seconds = args.seconds.min(600);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                Ok(ToolResult::ok(format!("waited {}s", seconds)))
            }
            _ = self.user_wake.notified() => {
                Ok(ToolResult::ok("woken early by a new user message"))
            }
            _ = self.cancel.cancelled() => {
                Ok(ToolResult::fail(self.catalog.aborted_message()))
            }
        }
    }
}

/// Ask the operator a question and relay the answer to the model.
pub struct AskUser {
    user_io: Arc<dyn UserIo>,
    cancel: CancelToken,
    catalog: Catalog,
    timeout: Duration,
}

impl AskUser {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            user_io: Arc::clone(&ctx.user_io),
            cancel: ctx.cancel.clone(),
            catalog: ctx.catalog,
            timeout: ASK_USER_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for AskUser {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the operator a question and wait up to five minutes for the reply."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"}
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            question: String,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        tokio::select! {
            answer = tokio::time::timeout(self.timeout, self.user_io.ask(&args.question)) => {
                match answer {
                    Ok(Some(reply)) if !reply.is_empty() => Ok(ToolResult::ok(reply)),
                    Ok(_) | Err(_) => Ok(ToolResult::ok(self.catalog.ask_user_timeout())),
                }
            }
            _ = self.cancel.cancelled() => {
                Ok(ToolResult::fail(self.catalog.aborted_message()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::knowledge::{Bm25KnowledgeStore, HostProfileStore};
    use crate::mcp::McpRegistry;
    use crate::terminal::{PipeTerminal, TerminalSession};
    use crate::tools::file::FileAccess;

    fn ctx_with_answers(answers: Vec<String>) -> ToolContext {
        let terminal: Arc<dyn TerminalSession> =
            Arc::new(PipeTerminal::spawn_local("t-interact", None).unwrap());
        ToolContext {
            terminal,
            terminal_cfg: TerminalConfig::default(),
            catalog: Catalog::default(),
            cancel: CancelToken::new(),
            knowledge: Arc::new(Bm25KnowledgeStore::new()),
            profiles: Arc::new(HostProfileStore::new()),
            host_id: "local".into(),
            plan: Arc::new(tokio::sync::Mutex::new(None)),
            mcp: Arc::new(McpRegistry::new()),
            user_io: Arc::new(ScriptedUserIo::new(answers)),
            user_wake: Arc::new(Notify::new()),
            files: FileAccess::Local,
        }
    }

    #[tokio::test]
    async fn test_wait_validates_seconds() {
        let ctx = ctx_with_answers(vec![]);
        let tool = WaitTool::new(&ctx);
        let result = tool.execute(serde_json::json!({"seconds": 0})).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_wait_completes() {
        tokio::time::pause();
        let ctx = ctx_with_answers(vec![]);
        let tool = WaitTool::new(&ctx);
        let fut = tool.execute(serde_json::json!({"seconds": 30}));
        let result = fut.await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("waited 30s"));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_user_message() {
        let ctx = ctx_with_answers(vec![]);
        let tool = WaitTool::new(&ctx);
        let wake = Arc::clone(&ctx.user_wake);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            wake.notify_waiters();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tool.execute(serde_json::json!({"seconds": 600})),
        )
        .await
        .expect("woke early")
        .unwrap();
        assert!(result.output.contains("woken early"));
    }

    #[tokio::test]
    async fn test_wait_aborts_on_cancel() {
        let ctx = ctx_with_answers(vec![]);
        let tool = WaitTool::new(&ctx);
        ctx.cancel.cancel();
        let result = tool.execute(serde_json::json!({"seconds": 600})).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_ask_user_scripted_answer() {
        let ctx = ctx_with_answers(vec!["use the staging db".to_string()]);
        let tool = AskUser::new(&ctx);
        let result = tool
            .execute(serde_json::json!({"question": "which db?"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "use the staging db");
    }

    #[tokio::test]
    async fn test_ask_user_times_out_with_default() {
        struct SilentIo;
        #[async_trait]
        impl UserIo for SilentIo {
            async fn ask(&self, _q: &str) -> Option<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                None
            }
        }
        let mut ctx = ctx_with_answers(vec![]);
        ctx.user_io = Arc::new(SilentIo);
        let tool = AskUser::new(&ctx).with_timeout(Duration::from_millis(50));
        let result = tool
            .execute(serde_json::json!({"question": "anyone there?"}))
            .await
            .unwrap();
        // Timeout resolves with the documented default, not a failure.
        assert!(result.success);
        assert!(result.output.contains("best judgement"));
    }
}
