//! Proxy tools for externally provided MCP server tools.
//!
//! Each connected server tool is registered under the namespaced name
//! `mcp__<serverId>__<toolName>`; calls forward through the registry and
//! transport errors come back as tool failures.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{Tool, ToolResult};
use crate::mcp::{McpRegistry, McpToolInfo, MCP_TOOL_PREFIX};
use crate::safety::RiskLevel;

pub struct McpProxyTool {
    registry: Arc<McpRegistry>,
    server_id: String,
    remote_name: String,
    namespaced: String,
    description: String,
    parameters: Value,
}

impl McpProxyTool {
    pub fn new(registry: Arc<McpRegistry>, server_id: &str, info: McpToolInfo) -> Self {
        Self {
            namespaced: format!("{}{}__{}", MCP_TOOL_PREFIX, server_id, info.name),
            registry,
            server_id: server_id.to_string(),
            remote_name: info.name,
            description: info.description,
            parameters: info.parameters,
        }
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.namespaced
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> Value {
        self.parameters.clone()
    }

    fn risk(&self, _args: &Value) -> RiskLevel {
        // External tools are opaque; treat them like local mutations.
        RiskLevel::Moderate
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        match self
            .registry
            .call_tool(&self.server_id, &self.remote_name, args)
            .await
        {
            Ok(result) if result.is_error => Ok(ToolResult::fail(result.content)),
            Ok(result) => Ok(ToolResult::ok(result.content)),
            Err(e) => Ok(ToolResult::fail(format!(
                "MCP call to {} failed: {}",
                self.server_id, e
            ))),
        }
    }
}
