// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

use relay_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

struct BgProcess {
    command: String,
    child: Option<Child>,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

/// Shared table of background processes, keyed by a locally-assigned handle.
///
/// Cloning a `BgProcessTool` shares the same table, so the `start`/`list`/
/// `output`/`kill` actions below all observe the same set of running jobs
/// regardless of which registered tool instance dispatched the call.
#[derive(Clone, Default)]
pub struct BgProcessTool {
    processes: Arc<Mutex<HashMap<String, BgProcess>>>,
}

impl BgProcessTool {
    async fn reap(&self, handle: &str) {
        let mut procs = self.processes.lock().await;
        if let Some(p) = procs.get_mut(handle) {
            if let Some(child) = p.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    p.exit_code = status.code();
                    p.child = None;
                }
            }
        }
    }

    async fn drain_output(&self, handle: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let table = self.processes.clone();
            let handle = handle.to_string();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut procs = table.lock().await;
                    if let Some(p) = procs.get_mut(&handle) {
                        if p.stdout.len() < OUTPUT_LIMIT {
                            p.stdout.push_str(&line);
                            p.stdout.push('\n');
                        }
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            let table = self.processes.clone();
            let handle = handle.to_string();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut procs = table.lock().await;
                    if let Some(p) = procs.get_mut(&handle) {
                        if p.stderr.len() < OUTPUT_LIMIT {
                            p.stderr.push_str(&line);
                            p.stderr.push('\n');
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Tool for BgProcessTool {
    fn name(&self) -> &str { "bg_process" }

    fn description(&self) -> &str {
        "Manages long-running background processes (dev servers, watchers, log tailers) that \
         would block a normal terminal command. Actions:\n\
         - start: launches 'command' and returns a handle immediately\n\
         - list: lists all tracked handles with their status\n\
         - output: returns buffered stdout/stderr for a handle\n\
         - kill: terminates a running process by handle\n\n\
         Use run_terminal_command for anything that finishes quickly. Prefer this tool over \
         backgrounding with '&' in a shell command — output is captured and the process is \
         kill()able without hunting for its pid."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["start", "list", "output", "kill"]
                },
                "command": { "type": "string", "description": "Shell command (action=start)" },
                "workdir": { "type": "string", "description": "Working directory (action=start)" },
                "handle": { "type": "string", "description": "Process handle (action=output|kill)" }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    fn output_category(&self) -> crate::tool::OutputCategory {
        crate::tool::OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let action = match call.args.get("action").and_then(|v| v.as_str()) {
            Some(a) => a,
            None => return ToolOutput::err(&call.id, "missing 'action' argument"),
        };

        match action {
            "start" => {
                let command = match call.args.get("command").and_then(|v| v.as_str()) {
                    Some(c) => c.to_string(),
                    None => return ToolOutput::err(&call.id, "missing 'command' argument"),
                };
                let workdir = call.args.get("workdir").and_then(|v| v.as_str()).map(str::to_string);

                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&command);
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
                if let Some(wd) = &workdir {
                    cmd.current_dir(wd);
                }

                let mut child = match cmd.spawn() {
                    Ok(c) => c,
                    Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
                };

                let handle = format!("bg-{}", child.id().unwrap_or(0));
                debug!(handle = %handle, cmd = %command, "bg_process started");
                self.drain_output(&handle, &mut child).await;

                self.processes.lock().await.insert(
                    handle.clone(),
                    BgProcess { command, child: Some(child), stdout: String::new(), stderr: String::new(), exit_code: None },
                );

                ToolOutput::ok(&call.id, format!("started {handle}"))
            }
            "list" => {
                let mut procs = self.processes.lock().await;
                let handles: Vec<String> = procs.keys().cloned().collect();
                drop(procs);
                for h in &handles {
                    self.reap(h).await;
                }
                procs = self.processes.lock().await;
                if procs.is_empty() {
                    return ToolOutput::ok(&call.id, "no background processes".to_string());
                }
                let mut lines = Vec::new();
                for (handle, p) in procs.iter() {
                    let status = match p.exit_code {
                        Some(code) => format!("exited({code})"),
                        None => "running".to_string(),
                    };
                    lines.push(format!("{handle}\t{status}\t{}", p.command));
                }
                lines.sort();
                ToolOutput::ok(&call.id, lines.join("\n"))
            }
            "output" => {
                let handle = match call.args.get("handle").and_then(|v| v.as_str()) {
                    Some(h) => h.to_string(),
                    None => return ToolOutput::err(&call.id, "missing 'handle' argument"),
                };
                self.reap(&handle).await;
                let procs = self.processes.lock().await;
                match procs.get(&handle) {
                    Some(p) => {
                        let mut content = p.stdout.clone();
                        if !p.stderr.is_empty() {
                            content.push_str("[stderr]\n");
                            content.push_str(&p.stderr);
                        }
                        ToolOutput::ok(&call.id, content)
                    }
                    None => ToolOutput::err(&call.id, format!("no such handle: {handle}")),
                }
            }
            "kill" => {
                let handle = match call.args.get("handle").and_then(|v| v.as_str()) {
                    Some(h) => h.to_string(),
                    None => return ToolOutput::err(&call.id, "missing 'handle' argument"),
                };
                let mut procs = self.processes.lock().await;
                match procs.get_mut(&handle) {
                    Some(p) => match p.child.as_mut() {
                        Some(child) => match child.kill().await {
                            Ok(_) => {
                                p.child = None;
                                ToolOutput::ok(&call.id, format!("killed {handle}"))
                            }
                            Err(e) => ToolOutput::err(&call.id, format!("kill error: {e}")),
                        },
                        None => ToolOutput::ok(&call.id, format!("{handle} already exited")),
                    },
                    None => ToolOutput::err(&call.id, format!("no such handle: {handle}")),
                }
            }
            other => ToolOutput::err(&call.id, format!("unknown action '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "b1".into(), name: "bg_process".into(), args }
    }

    #[tokio::test]
    async fn start_then_list_shows_handle() {
        let t = BgProcessTool::default();
        let started = t.execute(&call(json!({"action": "start", "command": "sleep 5"}))).await;
        assert!(!started.is_error, "{}", started.content);

        let listed = t.execute(&call(json!({"action": "list"}))).await;
        assert!(!listed.is_error);
        assert!(listed.content.contains("running"));
    }

    #[tokio::test]
    async fn start_output_and_kill_lifecycle() {
        let t = BgProcessTool::default();
        let started = t.execute(&call(json!({"action": "start", "command": "echo hi; sleep 5"}))).await;
        let handle = started.content.trim_start_matches("started ").to_string();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let out = t.execute(&call(json!({"action": "output", "handle": handle}))).await;
        assert!(out.content.contains("hi"));

        let killed = t.execute(&call(json!({"action": "kill", "handle": handle}))).await;
        assert!(!killed.is_error, "{}", killed.content);
    }

    #[tokio::test]
    async fn unknown_handle_is_error() {
        let t = BgProcessTool::default();
        let out = t.execute(&call(json!({"action": "output", "handle": "bg-999999"}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_action_is_error() {
        let t = BgProcessTool::default();
        let out = t.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }

    #[test]
    fn only_available_in_agent_mode() {
        let t = BgProcessTool::default();
        assert_eq!(t.modes(), &[AgentMode::Agent]);
    }
}
