//! Knowledge tools: durable host facts and ranked recall.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{parse_args, Tool, ToolContext, ToolResult};
use crate::knowledge::{HostProfile, HostProfileStore, KnowledgeStore};

/// Persist a fact about the current host (or globally).
pub struct RememberInfo {
    knowledge: Arc<dyn KnowledgeStore>,
    profiles: Arc<HostProfileStore>,
    host_id: String,
}

impl RememberInfo {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            knowledge: Arc::clone(&ctx.knowledge),
            profiles: Arc::clone(&ctx.profiles),
            host_id: ctx.host_id.clone(),
        }
    }
}

#[async_trait]
impl Tool for RememberInfo {
    fn name(&self) -> &str {
        "remember_info"
    }

    fn description(&self) -> &str {
        "Persist a durable fact about this host (credentials excluded). Structured facts like shell, os or working_dir update the host profile."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "fact": {"type": "string", "description": "What to remember"},
                "kind": {"type": "string", "enum": ["note", "shell", "os", "working_dir"], "default": "note"},
                "global": {"type": "boolean", "default": false, "description": "Store without host scoping"}
            },
            "required": ["fact"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            fact: String,
            #[serde(default = "default_kind")]
            kind: String,
            #[serde(default)]
            global: bool,
        }
        fn default_kind() -> String {
            "note".to_string()
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        if args.fact.trim().is_empty() {
            return Ok(ToolResult::fail("nothing to remember"));
        }

        // Structured facts route to the host profile so the prompt builder
        // picks them up directly.
        match args.kind.as_str() {
            "shell" => {
                self.profiles
                    .update(
                        &self.host_id,
                        HostProfile {
                            shell: Some(args.fact.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            "os" => {
                self.profiles
                    .update(
                        &self.host_id,
                        HostProfile {
                            os: Some(args.fact.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            "working_dir" => {
                self.profiles
                    .update(
                        &self.host_id,
                        HostProfile {
                            working_dir: Some(args.fact.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            _ => {}
        }

        let host = if args.global {
            None
        } else {
            Some(self.host_id.as_str())
        };
        self.knowledge.remember(host, &args.fact).await;
        Ok(ToolResult::ok("remembered"))
    }
}

/// Ranked search over the knowledge store.
pub struct SearchKnowledge {
    knowledge: Arc<dyn KnowledgeStore>,
    host_id: String,
}

impl SearchKnowledge {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            knowledge: Arc::clone(&ctx.knowledge),
            host_id: ctx.host_id.clone(),
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledge {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search remembered facts by relevance. Defaults to this host; set all_hosts=true to search everything."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": 20, "default": 5},
                "all_hosts": {"type": "boolean", "default": false}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            query: String,
            #[serde(default = "default_top_k")]
            top_k: usize,
            #[serde(default)]
            all_hosts: bool,
        }
        fn default_top_k() -> usize {
            5
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let host = if args.all_hosts {
            None
        } else {
            Some(self.host_id.as_str())
        };
        let hits = self
            .knowledge
            .search(&args.query, args.top_k.clamp(1, 20), host)
            .await;
        if hits.is_empty() {
            return Ok(ToolResult::ok("no matching facts"));
        }
        let rendered: Vec<String> = hits
            .iter()
            .map(|h| match &h.host_id {
                Some(host) => format!("- [{}] {}", host, h.fact),
                None => format!("- {}", h.fact),
            })
            .collect();
        Ok(ToolResult::ok(rendered.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::engine::cancel::CancelToken;
    use crate::i18n::Catalog;
    use crate::knowledge::Bm25KnowledgeStore;
    use crate::mcp::McpRegistry;
    use crate::terminal::{PipeTerminal, TerminalSession};
    use crate::tools::file::FileAccess;
    use crate::tools::interact::ScriptedUserIo;

    fn test_ctx() -> ToolContext {
        let terminal: Arc<dyn TerminalSession> =
            Arc::new(PipeTerminal::spawn_local("t-knowledge", None).unwrap());
        ToolContext {
            terminal,
            terminal_cfg: TerminalConfig::default(),
            catalog: Catalog::default(),
            cancel: CancelToken::new(),
            knowledge: Arc::new(Bm25KnowledgeStore::new()),
            profiles: Arc::new(HostProfileStore::new()),
            host_id: "web-1".into(),
            plan: Arc::new(tokio::sync::Mutex::new(None)),
            mcp: Arc::new(McpRegistry::new()),
            user_io: Arc::new(ScriptedUserIo::new(vec![])),
            user_wake: Arc::new(tokio::sync::Notify::new()),
            files: FileAccess::Local,
        }
    }

    #[tokio::test]
    async fn test_remember_then_search() {
        let ctx = test_ctx();
        let remember = RememberInfo::new(&ctx);
        let search = SearchKnowledge::new(&ctx);

        remember
            .execute(serde_json::json!({"fact": "nginx logs rotate nightly at 02:00"}))
            .await
            .unwrap();
        let result = search
            .execute(serde_json::json!({"query": "nginx logs"}))
            .await
            .unwrap();
        assert!(result.output.contains("rotate nightly"));
    }

    #[tokio::test]
    async fn test_structured_fact_updates_profile() {
        let ctx = test_ctx();
        let remember = RememberInfo::new(&ctx);
        remember
            .execute(serde_json::json!({"fact": "zsh", "kind": "shell"}))
            .await
            .unwrap();
        let profile = ctx.profiles.get("web-1").await;
        assert_eq!(profile.shell.as_deref(), Some("zsh"));
    }

    #[tokio::test]
    async fn test_empty_fact_rejected() {
        let ctx = test_ctx();
        let remember = RememberInfo::new(&ctx);
        let result = remember
            .execute(serde_json::json!({"fact": "  "}))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_search_no_hits() {
        let ctx = test_ctx();
        let search = SearchKnowledge::new(&ctx);
        let result = search
            .execute(serde_json::json!({"query": "anything"}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("no matching facts"));
    }
}
