//! Orchestrates connections to multiple MCP servers.

use crate::client::{CallContext, ClientOptions, McpClient};
use crate::config::{ClientIdentity, McpConfig, McpServerConfig};
use crate::error::McpError;
use crate::tool::{Tool, ToolContent};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Running clients keyed by server name, plus the servers that did not come up.
pub struct McpManager {
    clients: BTreeMap<String, Arc<McpClient>>,
    failed: Vec<(String, McpError)>,
}

impl McpManager {
    /// Start every configured server, one after another in name order.
    ///
    /// A server that fails is logged and remembered in [`failed`](Self::failed);
    /// the rest still start. Cancelling `ctx` stops launching further servers.
    pub async fn start(config: &McpConfig, ctx: &CallContext) -> Self {
        let mut manager = Self::from_clients(Vec::new());

        for (name, server_config) in &config.servers {
            if ctx.cancel.is_cancelled() {
                tracing::debug!("Startup cancelled before MCP server '{}'", name);
                break;
            }
            match launch(name, server_config, &config.client, ctx).await {
                Ok(client) => {
                    tracing::info!(
                        server = %name,
                        tools = client.tools().len(),
                        "MCP server ready"
                    );
                    manager.clients.insert(name.clone(), Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!("Skipping MCP server '{}': {}", name, e);
                    manager.failed.push((name.clone(), e));
                }
            }
        }

        manager
    }

    /// Build a manager over clients that are already started.
    pub fn from_clients(clients: Vec<Arc<McpClient>>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.server_name().to_string(), c))
                .collect(),
            failed: Vec::new(),
        }
    }

    /// Look up a connected server by name.
    pub fn client(&self, name: &str) -> Option<&Arc<McpClient>> {
        self.clients.get(name)
    }

    /// Servers that failed to start, with the reason.
    pub fn failed(&self) -> &[(String, McpError)] {
        &self.failed
    }

    /// Every discovered tool with the client that offers it, in server order.
    pub fn tools(&self) -> Vec<(Arc<McpClient>, Tool)> {
        self.clients
            .values()
            .flat_map(|client| {
                client
                    .tools()
                    .iter()
                    .map(move |tool| (Arc::clone(client), tool.clone()))
            })
            .collect()
    }

    /// The first ready server offering a tool with this name.
    pub fn find_tool(&self, tool_name: &str) -> Option<&Arc<McpClient>> {
        self.clients
            .values()
            .find(|c| c.is_ready() && c.tool(tool_name).is_some())
    }

    /// Route a tool call to the named server.
    pub async fn call_tool(
        &self,
        server: &str,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        ctx: &CallContext,
    ) -> Result<Vec<ToolContent>, McpError> {
        match self.client(server) {
            Some(client) => client.call_tool(tool_name, arguments, ctx).await,
            None => Err(McpError::UnknownServer(server.to_string())),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Name and tool count of each connected server.
    pub fn server_summary(&self) -> Vec<(&str, usize)> {
        self.clients
            .iter()
            .map(|(name, c)| (name.as_str(), c.tools().len()))
            .collect()
    }

    /// Stop every client and its server process.
    pub async fn shutdown(self) {
        for (name, client) in self.clients {
            client.stop().await;
            tracing::debug!("MCP server '{}' stopped", name);
        }
    }
}

async fn launch(
    name: &str,
    server_config: &McpServerConfig,
    identity: &ClientIdentity,
    ctx: &CallContext,
) -> Result<McpClient, McpError> {
    let options = ClientOptions::for_server(server_config, identity);
    let client = McpClient::spawn(name, server_config, options)?;
    client.start(ctx).await?;
    Ok(client)
}
