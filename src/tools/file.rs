//! File tools: read and mode-based writes, local or remote.
//!
//! Local sessions get the full write-mode set. Remote sessions go through
//! the narrow [`RemoteFileStore`] interface the host application provides
//! (an SFTP channel in practice) and support only `create`, `overwrite`
//! and `append`.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::{parse_args, Tool, ToolContext, ToolResult};
use crate::safety::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Create,
    Overwrite,
    Append,
    Insert,
    ReplaceLines,
    RegexReplace,
}

impl WriteMode {
    fn supported_remotely(self) -> bool {
        matches!(self, WriteMode::Create | WriteMode::Overwrite | WriteMode::Append)
    }
}

/// Remote file access provided by the session transport.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn write(&self, path: &str, content: &str, append: bool) -> Result<()>;
}

/// Where file tools operate for this run.
#[derive(Clone)]
pub enum FileAccess {
    Local,
    Remote(Arc<dyn RemoteFileStore>),
}

pub struct ReadFile {
    access: FileAccess,
}

impl ReadFile {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            access: ctx.files.clone(),
        }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the session's filesystem. Supports an optional line range."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer", "minimum": 1},
                "end_line": {"type": "integer", "minimum": 1}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            path: String,
            start_line: Option<usize>,
            end_line: Option<usize>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let content = match &self.access {
            FileAccess::Local => tokio::fs::read_to_string(&args.path).await?,
            FileAccess::Remote(store) => store.read(&args.path).await?,
        };

        let output = match (args.start_line, args.end_line) {
            (None, None) => content,
            (start, end) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = start.unwrap_or(1).max(1);
                let end = end.unwrap_or(lines.len()).min(lines.len());
                if start > lines.len() {
                    return Ok(ToolResult::fail(format!(
                        "start_line {} is past the end of the file ({} lines)",
                        start,
                        lines.len()
                    )));
                }
                lines[start - 1..end].join("\n")
            }
        };
        Ok(ToolResult::ok(output))
    }
}

pub struct WriteFile {
    access: FileAccess,
}

impl WriteFile {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            access: ctx.files.clone(),
        }
    }

    async fn write_local(&self, args: WriteArgs) -> Result<ToolResult> {
        let path = Path::new(&args.path);
        let exists = path.exists();

        match args.mode {
            WriteMode::Create => {
                if exists {
                    return Ok(ToolResult::fail(format!(
                        "{} already exists; use overwrite to replace it",
                        args.path
                    )));
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                tokio::fs::write(path, &args.content).await?;
            }
            WriteMode::Overwrite => {
                tokio::fs::write(path, &args.content).await?;
            }
            WriteMode::Append => {
                let mut existing = if exists {
                    tokio::fs::read_to_string(path).await?
                } else {
                    String::new()
                };
                existing.push_str(&args.content);
                tokio::fs::write(path, existing).await?;
            }
            WriteMode::Insert => {
                let existing = tokio::fs::read_to_string(path).await?;
                let mut lines: Vec<&str> = existing.lines().collect();
                let Some(at) = args.line else {
                    return Ok(ToolResult::fail("insert mode requires a 1-based line index"));
                };
                if at < 1 || at > lines.len() + 1 {
                    return Ok(ToolResult::fail(format!(
                        "line {} out of bounds for a {}-line file",
                        at,
                        lines.len()
                    )));
                }
                lines.insert(at - 1, &args.content);
                tokio::fs::write(path, rejoin(&lines, &existing)).await?;
            }
            WriteMode::ReplaceLines => {
                let existing = tokio::fs::read_to_string(path).await?;
                let lines: Vec<&str> = existing.lines().collect();
                let (Some(start), Some(end)) = (args.line, args.end_line) else {
                    return Ok(ToolResult::fail(
                        "replace_lines mode requires line and end_line",
                    ));
                };
                if start < 1 || end < start || end > lines.len() {
                    return Ok(ToolResult::fail(format!(
                        "line range {}..{} out of bounds for a {}-line file",
                        start,
                        end,
                        lines.len()
                    )));
                }
                let mut rebuilt: Vec<&str> = Vec::new();
                rebuilt.extend(&lines[..start - 1]);
                rebuilt.push(&args.content);
                rebuilt.extend(&lines[end..]);
                tokio::fs::write(path, rejoin(&rebuilt, &existing)).await?;
            }
            WriteMode::RegexReplace => {
                let existing = tokio::fs::read_to_string(path).await?;
                let Some(pattern) = &args.pattern else {
                    return Ok(ToolResult::fail("regex_replace mode requires a pattern"));
                };
                let re = match regex::Regex::new(pattern) {
                    Ok(re) => re,
                    Err(e) => return Ok(ToolResult::fail(format!("invalid pattern: {}", e))),
                };
                if !re.is_match(&existing) {
                    // Zero replacements must fail loudly, never succeed
                    // silently.
                    return Ok(ToolResult::fail(format!(
                        "pattern matched nothing in {}",
                        args.path
                    )));
                }
                let replaced = re.replace_all(&existing, args.content.as_str());
                tokio::fs::write(path, replaced.as_ref()).await?;
            }
        }
        Ok(ToolResult::ok(format!("wrote {}", args.path)))
    }

    async fn write_remote(
        &self,
        store: &Arc<dyn RemoteFileStore>,
        args: WriteArgs,
    ) -> Result<ToolResult> {
        if !args.mode.supported_remotely() {
            return Ok(ToolResult::fail(
                "remote sessions support only create, overwrite and append modes",
            ));
        }
        match args.mode {
            WriteMode::Create => {
                if store.exists(&args.path).await? {
                    return Ok(ToolResult::fail(format!(
                        "{} already exists; use overwrite to replace it",
                        args.path
                    )));
                }
                store.write(&args.path, &args.content, false).await?;
            }
            WriteMode::Overwrite => store.write(&args.path, &args.content, false).await?,
            WriteMode::Append => store.write(&args.path, &args.content, true).await?,
            _ => unreachable!("filtered by supported_remotely"),
        }
        Ok(ToolResult::ok(format!("wrote {}", args.path)))
    }
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
    mode: WriteMode,
    /// 1-based line index for insert / start of replace_lines.
    line: Option<usize>,
    end_line: Option<usize>,
    pattern: Option<String>,
}

/// Rebuild file content from lines, preserving a trailing newline if the
/// original had one.
fn rejoin(lines: &[&str], original: &str) -> String {
    let mut out = lines.join("\n");
    if original.ends_with('\n') {
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file with one of the modes: create, overwrite, append, insert, replace_lines, regex_replace. Remote sessions support only the first three."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "mode": {"type": "string", "enum": ["create", "overwrite", "append", "insert", "replace_lines", "regex_replace"]},
                "line": {"type": "integer", "minimum": 1, "description": "1-based line for insert / replace_lines start"},
                "end_line": {"type": "integer", "minimum": 1, "description": "replace_lines end (inclusive)"},
                "pattern": {"type": "string", "description": "Regex for regex_replace"}
            },
            "required": ["path", "content", "mode"]
        })
    }

    fn risk(&self, _args: &Value) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let args: WriteArgs = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };
        match &self.access {
            FileAccess::Local => self.write_local(args).await,
            FileAccess::Remote(store) => self.write_remote(store, args).await,
        }
    }
}
