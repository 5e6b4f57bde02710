// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The `subagent` tool: the model-facing surface of [`crate::subagent::SubagentManager`].
//!
//! Each action drives one `SubagentManager` call. `spawn` builds an isolated
//! `Agent` (its own session, its own tool registry that does not re-register
//! `subagent` itself, capping nesting at [`MAX_DEPTH`]) and hands its future
//! to the manager; the manager owns concurrency limits and lifecycle state
//! from then on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use relay_config::{AgentConfig, AgentMode, Config};
use relay_tools::{
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
    ApplyPatchTool, BgProcessTool, DeleteFileTool, EditFileTool, GitTool, GlobFileSearchTool,
    GrepTool, ListDirTool, PreviewTool, ReadFileTool, RunTerminalCommandTool, ToolRegistry,
    WebFetchTool, WebSearchTool, WriteTool,
};

use crate::agent::Agent;
use crate::events::AgentEvent;
use crate::runtime_context::AgentRuntimeContext;
use crate::subagent::{SubagentManager, CANCELLED_SENTINEL};

const MAX_DEPTH: usize = 3;

pub struct SubagentTool {
    model: Arc<dyn relay_model::ModelProvider>,
    config: Arc<Config>,
    agent_config: Arc<AgentConfig>,
    depth: Arc<AtomicUsize>,
    manager: Arc<SubagentManager>,
}

impl SubagentTool {
    pub fn new(
        model: Arc<dyn relay_model::ModelProvider>,
        config: Arc<Config>,
        agent_config: Arc<AgentConfig>,
        depth: Arc<AtomicUsize>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            model,
            config,
            agent_config,
            depth,
            manager: Arc::new(SubagentManager::new(max_concurrent)),
        }
    }

    fn build_sub_registry(&self) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(ListDirTool);
        reg.register(GlobFileSearchTool);
        reg.register(GrepTool);
        reg.register(WebFetchTool);
        reg.register(WebSearchTool { api_key: self.config.tools.web.search.api_key.clone() });
        reg.register(WriteTool);
        reg.register(EditFileTool);
        reg.register(DeleteFileTool);
        reg.register(ApplyPatchTool);
        reg.register(PreviewTool);
        reg.register(GitTool);
        reg.register(BgProcessTool::default());
        reg.register(RunTerminalCommandTool { timeout_secs: self.config.tools.timeout_secs });
        // `subagent` is intentionally not registered here, capping nesting depth.
        reg
    }

    async fn spawn_sub_agent(
        &self,
        prompt: String,
        mode: AgentMode,
        max_rounds: Option<u64>,
    ) -> Result<String, String> {
        let mut sub_config = (*self.agent_config).clone();
        if let Some(max_rounds) = max_rounds {
            sub_config.max_tool_rounds = max_rounds as u32;
        }

        let tools = Arc::new(self.build_sub_registry());
        let model = self.model.clone();
        let sub_config = Arc::new(sub_config);
        let depth = Arc::clone(&self.depth);

        self.manager
            .spawn(prompt.chars().take(60).collect::<String>(), None, move |cancel| async move {
                let (_evt_tx, evt_rx) = mpsc::channel(8);
                let mode_lock = Arc::new(Mutex::new(mode));
                let mut agent = Agent::new(
                    model,
                    tools,
                    sub_config,
                    AgentRuntimeContext::default(),
                    mode_lock,
                    evt_rx,
                    128_000,
                );

                // Drain the progress channel concurrently with the run so a
                // chatty sub-agent can never fill the buffer and deadlock
                // against its own producer. `submit_with_cancel` reports a
                // cancelled run via an `Aborted` event, not an `Err`, so the
                // collector is what actually detects cancellation here.
                let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
                let collector = tokio::spawn(async move {
                    let mut output = String::new();
                    let mut aborted = false;
                    while let Some(event) = rx.recv().await {
                        match event {
                            AgentEvent::TextDelta(delta) => output.push_str(&delta),
                            AgentEvent::Aborted { partial_text } => {
                                aborted = true;
                                output = partial_text;
                            }
                            _ => {}
                        }
                    }
                    (output, aborted)
                });

                let submit = agent.submit_with_cancel(&prompt, tx, cancel).await;
                depth.fetch_sub(1, Ordering::Relaxed);
                let (output, aborted) = collector.await.unwrap_or_default();

                match submit {
                    Ok(()) if aborted => Err(CANCELLED_SENTINEL.to_string()),
                    Ok(()) if output.is_empty() => Ok("(sub-agent produced no text output)".to_string()),
                    Ok(()) => Ok(output),
                    Err(e) => Err(format!("sub-agent error: {e}")),
                }
            })
            .await
    }
}

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &str {
        "subagent"
    }

    fn description(&self) -> &str {
        "Spawn, monitor, and collect results from background sub-agents. \
         Actions: spawn (starts a focused sub-agent and returns a run id), \
         list (summarizes all known runs), status (one run's lifecycle \
         state), result (the sub-agent's final text, once terminal), stop \
         (requests cancellation), remove (forgets a terminal run). Maximum \
         nesting depth is 3."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["spawn", "list", "status", "result", "stop", "remove"]
                },
                "prompt": { "type": "string", "description": "Required for 'spawn'" },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for a spawned sub-agent (default: agent)"
                },
                "max_rounds": { "type": "integer" },
                "run_id": { "type": "string", "description": "Required for status/result/stop/remove" }
            },
            "required": ["action"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let action = call.args.get("action").and_then(|v| v.as_str()).unwrap_or("");

        match action {
            "spawn" => {
                let Some(prompt) = call.args.get("prompt").and_then(|v| v.as_str()) else {
                    return ToolOutput::err(&call.id, "missing 'prompt'");
                };
                let mode = match call.args.get("mode").and_then(|v| v.as_str()).unwrap_or("agent") {
                    "research" => AgentMode::Research,
                    "plan" => AgentMode::Plan,
                    "agent" => AgentMode::Agent,
                    other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
                };
                let max_rounds = call.args.get("max_rounds").and_then(|v| v.as_u64());

                if self.depth.load(Ordering::Relaxed) >= MAX_DEPTH {
                    return ToolOutput::err(&call.id, format!("maximum sub-agent depth ({MAX_DEPTH}) reached"));
                }
                self.depth.fetch_add(1, Ordering::Relaxed);

                match self.spawn_sub_agent(prompt.to_string(), mode, max_rounds).await {
                    Ok(run_id) => ToolOutput::ok(&call.id, run_id),
                    Err(e) => {
                        self.depth.fetch_sub(1, Ordering::Relaxed);
                        ToolOutput::err(&call.id, e)
                    }
                }
            }
            "list" => {
                let runs = self.manager.list().await;
                match serde_json::to_string(&runs) {
                    Ok(json) => ToolOutput::ok(&call.id, json),
                    Err(e) => ToolOutput::err(&call.id, format!("failed to serialize run list: {e}")),
                }
            }
            "status" => {
                let Some(run_id) = call.args.get("run_id").and_then(|v| v.as_str()) else {
                    return ToolOutput::err(&call.id, "missing 'run_id'");
                };
                match self.manager.status(run_id).await {
                    Some(status) => ToolOutput::ok(&call.id, format!("{status:?}")),
                    None => ToolOutput::err(&call.id, "no such run"),
                }
            }
            "result" => {
                let Some(run_id) = call.args.get("run_id").and_then(|v| v.as_str()) else {
                    return ToolOutput::err(&call.id, "missing 'run_id'");
                };
                match self.manager.get_result(run_id).await {
                    Ok(text) => ToolOutput::ok(&call.id, text),
                    Err(e) => ToolOutput::err(&call.id, e),
                }
            }
            "stop" => {
                let Some(run_id) = call.args.get("run_id").and_then(|v| v.as_str()) else {
                    return ToolOutput::err(&call.id, "missing 'run_id'");
                };
                if self.manager.stop(run_id).await {
                    ToolOutput::ok(&call.id, "cancellation requested")
                } else {
                    ToolOutput::err(&call.id, "run not found or already finished")
                }
            }
            "remove" => {
                let Some(run_id) = call.args.get("run_id").and_then(|v| v.as_str()) else {
                    return ToolOutput::err(&call.id, "missing 'run_id'");
                };
                match self.manager.remove(run_id).await {
                    Ok(()) => ToolOutput::ok(&call.id, "removed"),
                    Err(e) => ToolOutput::err(&call.id, e),
                }
            }
            other => ToolOutput::err(&call.id, format!("unknown action: {other}")),
        }
    }
}
