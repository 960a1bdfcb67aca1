//! Model Context Protocol integration surface.
//!
//! The core never speaks the MCP wire protocol itself; it forwards
//! namespaced tool calls (`mcp__<serverId>__<toolName>`) to a transport
//! behind [`McpTransport`]. The registry owns one connection slot per
//! server and refuses calls to servers marked disconnected.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Prefix marking a tool as MCP-proxied.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// A tool advertised by a connected MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of a proxied MCP tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallResult {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Transport to one MCP server. Implemented by the host application; the
/// core only needs call and discovery.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>>;
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<McpCallResult>;
}

struct ServerSlot {
    transport: Arc<dyn McpTransport>,
    connected: bool,
}

/// Connection pool of MCP servers, keyed by server id.
#[derive(Default)]
pub struct McpRegistry {
    servers: RwLock<HashMap<String, ServerSlot>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, server_id: impl Into<String>, transport: Arc<dyn McpTransport>) {
        self.servers.write().await.insert(
            server_id.into(),
            ServerSlot {
                transport,
                connected: true,
            },
        );
    }

    /// Mark a server disconnected without dropping its slot; subsequent
    /// calls fail fast instead of hitting a dead transport.
    pub async fn mark_disconnected(&self, server_id: &str) {
        if let Some(slot) = self.servers.write().await.get_mut(server_id) {
            slot.connected = false;
        }
    }

    pub async fn list_connected_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .servers
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<McpToolInfo>> {
        let transport = self.connected_transport(server_id).await?;
        transport.list_tools().await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<McpCallResult> {
        let transport = self.connected_transport(server_id).await?;
        transport.call_tool(tool_name, args).await
    }

    async fn connected_transport(&self, server_id: &str) -> Result<Arc<dyn McpTransport>> {
        let servers = self.servers.read().await;
        match servers.get(server_id) {
            Some(slot) if slot.connected => Ok(Arc::clone(&slot.transport)),
            Some(_) => anyhow::bail!("MCP server '{}' is disconnected", server_id),
            None => anyhow::bail!("MCP server '{}' is not registered", server_id),
        }
    }
}

/// Split `mcp__<serverId>__<toolName>` into its parts. The tool name may
/// itself contain double underscores; the server id may not.
pub fn parse_mcp_tool_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_TOOL_PREFIX)?;
    let sep = rest.find("__")?;
    let (server, tool) = (&rest[..sep], &rest[sep + 2..]);
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}
