// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Imports tools from configured external MCP servers into a relay
//! [`ToolRegistry`].
//!
//! Each configured server is spawned as a child process, asked for its
//! `tools/list`, and every advertised tool is wrapped as an
//! [`McpProxyTool`] under the name `mcp__<server>__<tool>`.  A server that
//! fails to start or hang up during the handshake is skipped with a warning
//! rather than failing the whole import — one broken MCP server should not
//! take down every other tool.

use std::sync::Arc;

use relay_tools::ToolRegistry;
use tracing::warn;

use crate::client::{McpClient, McpProxyTool, McpServerConfig};

/// Connect to every server in `configs` and register all tools it
/// advertises into a fresh [`ToolRegistry`].
///
/// Returns the registry plus the names of servers that could not be reached,
/// so callers can surface a partial-startup warning instead of silently
/// losing a whole integration.
pub async fn import_mcp_tools(configs: &[McpServerConfig]) -> (ToolRegistry, Vec<String>) {
    let mut reg = ToolRegistry::new();
    let mut failed = Vec::new();

    for config in configs {
        match McpClient::connect(config).await {
            Ok(client) => {
                let client = Arc::new(client);
                match client.list_tools().await {
                    Ok(tools) => {
                        for tool in &tools {
                            reg.register(McpProxyTool::new(client.clone(), &config.name, tool));
                        }
                    }
                    Err(e) => {
                        warn!(server = %config.name, error = %e, "failed to list tools from MCP server");
                        failed.push(config.name.clone());
                    }
                }
            }
            Err(e) => {
                warn!(server = %config.name, error = %e, "failed to connect to MCP server");
                failed.push(config.name.clone());
            }
        }
    }

    (reg, failed)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
