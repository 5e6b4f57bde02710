// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Connects to an external MCP server as a child process and wraps each
//! tool it advertises as a [`relay_tools::Tool`], so the rest of the gateway
//! can call it exactly like a builtin.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, Tool as McpTool};
use rmcp::service::RunningService;
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use relay_config::AgentMode;
use relay_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput};

use crate::bridge::{call_result_to_output, mcp_tool_schema};

/// Configuration for one external MCP server the gateway should import
/// tools from.  Only the `stdio` child-process transport is supported —
/// relay speaks MCP the same way Claude Desktop or Cursor do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Short identifier used to namespace imported tool names, e.g. `"github"`.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// A live connection to one external MCP server.
pub struct McpClient {
    name: String,
    service: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// Spawn `config.command` and perform the MCP `initialize` handshake.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        let transport = TokioChildProcess::new(cmd)
            .with_context(|| format!("spawning MCP server '{}'", config.name))?;
        let service = ()
            .serve(transport)
            .await
            .with_context(|| format!("initializing MCP server '{}'", config.name))?;
        Ok(Self { name: config.name.clone(), service })
    }

    /// List the tools this server advertises.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self
            .service
            .list_all_tools()
            .await
            .with_context(|| format!("listing tools on MCP server '{}'", self.name))?;
        Ok(result)
    }

    async fn call(&self, name: &str, args: serde_json::Value) -> Result<rmcp::model::CallToolResult> {
        let arguments = match args {
            serde_json::Value::Object(m) => Some(m),
            serde_json::Value::Null => None,
            other => {
                let mut m = serde_json::Map::new();
                m.insert("value".to_string(), other);
                Some(m)
            }
        };
        let result = self
            .service
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .with_context(|| format!("calling '{name}' on MCP server '{}'", self.name))?;
        Ok(result)
    }

    pub async fn close(self) -> Result<()> {
        self.service.cancel().await?;
        Ok(())
    }
}

/// Adapts a single tool advertised by an [`McpClient`] to relay's [`Tool`]
/// trait.  The exposed name is namespaced as `mcp__<server>__<tool>` to
/// avoid collisions between tools from different servers (or with builtins).
pub struct McpProxyTool {
    client: Arc<McpClient>,
    remote_name: String,
    exposed_name: String,
    description: String,
    schema: serde_json::Value,
}

impl McpProxyTool {
    pub fn new(client: Arc<McpClient>, server_name: &str, tool: &McpTool) -> Self {
        Self {
            exposed_name: format!("mcp__{server_name}__{}", tool.name),
            remote_name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or("(no description provided by MCP server)")
                .to_string(),
            schema: mcp_tool_schema(tool),
            client,
        }
    }
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str { &self.exposed_name }

    fn description(&self) -> &str { &self.description }

    fn parameters_schema(&self) -> serde_json::Value { self.schema.clone() }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.call(&self.remote_name, call.args.clone()).await {
            Ok(result) => call_result_to_output(&call.id, result),
            Err(e) => ToolOutput::err(&call.id, format!("MCP call failed: {e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_deserializes_from_json() {
        let cfg: McpServerConfig = serde_json::from_value(serde_json::json!({
            "name": "github",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-github"]
        }))
        .unwrap();
        assert_eq!(cfg.name, "github");
        assert_eq!(cfg.args.len(), 2);
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn proxy_tool_name_is_namespaced() {
        let tool = McpTool::new(
            std::borrow::Cow::Borrowed("search"),
            std::borrow::Cow::Borrowed("Searches issues"),
            std::sync::Arc::new(serde_json::Map::new()),
        );
        // Exercise the naming scheme without a live connection: construct the
        // exposed name the same way `McpProxyTool::new` does.
        let exposed = format!("mcp__{}__{}", "github", tool.name);
        assert_eq!(exposed, "mcp__github__search");
    }
}
