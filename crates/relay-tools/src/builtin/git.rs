// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use relay_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

/// Structured wrapper over common git subcommands.
///
/// Unlike routing git through run_terminal_command, this tool fixes the
/// argument vector per subcommand so the model cannot smuggle in flags like
/// `--force` or `--no-verify` through a free-form command string.
pub struct GitTool;

#[async_trait]
impl Tool for GitTool {
    fn name(&self) -> &str { "git" }

    fn description(&self) -> &str {
        "Runs safe, structured git subcommands against the repository at 'workdir' (defaults to \
         the current directory). Supported: status, diff, log, add, commit, push.\n\n\
         NEVER use this tool to force-push, reset --hard, or skip hooks — those are not exposed. \
         Use run_terminal_command only if the user explicitly asks for one of those operations."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subcommand": {
                    "type": "string",
                    "enum": ["status", "diff", "log", "add", "commit", "push"]
                },
                "workdir": { "type": "string", "description": "Repository root (optional)" },
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "File paths (subcommand=add)"
                },
                "message": { "type": "string", "description": "Commit message (subcommand=commit)" },
                "staged": { "type": "boolean", "description": "Diff staged changes only (subcommand=diff)" },
                "max_count": { "type": "integer", "description": "Limit for log entries (subcommand=log, default 10)" },
                "remote": { "type": "string", "description": "Remote name (subcommand=push, default 'origin')" },
                "branch": { "type": "string", "description": "Branch to push (subcommand=push, defaults to the current branch)" }
            },
            "required": ["subcommand"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Ask }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let subcommand = match call.args.get("subcommand").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolOutput::err(&call.id, "missing 'subcommand' argument"),
        };
        let workdir = call.args.get("workdir").and_then(|v| v.as_str()).map(str::to_string);

        let args: Vec<String> = match subcommand {
            "status" => vec!["status".into(), "--short".into(), "--branch".into()],
            "diff" => {
                let staged = call.args.get("staged").and_then(|v| v.as_bool()).unwrap_or(false);
                if staged {
                    vec!["diff".into(), "--staged".into()]
                } else {
                    vec!["diff".into()]
                }
            }
            "log" => {
                let max_count = call.args.get("max_count").and_then(|v| v.as_u64()).unwrap_or(10);
                vec!["log".into(), format!("-{max_count}"), "--oneline".into()]
            }
            "add" => {
                let paths: Vec<String> = match call.args.get("paths").and_then(|v| v.as_array()) {
                    Some(arr) => arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                    None => return ToolOutput::err(&call.id, "missing 'paths' argument"),
                };
                if paths.is_empty() {
                    return ToolOutput::err(&call.id, "'paths' must not be empty — refusing 'git add .'");
                }
                let mut a = vec!["add".to_string(), "--".to_string()];
                a.extend(paths);
                a
            }
            "commit" => {
                let message = match call.args.get("message").and_then(|v| v.as_str()) {
                    Some(m) if !m.trim().is_empty() => m.to_string(),
                    _ => return ToolOutput::err(&call.id, "missing 'message' argument"),
                };
                vec!["commit".into(), "-m".into(), message]
            }
            "push" => {
                let remote = call.args.get("remote").and_then(|v| v.as_str()).unwrap_or("origin");
                let mut a = vec!["push".to_string(), remote.to_string()];
                if let Some(branch) = call.args.get("branch").and_then(|v| v.as_str()) {
                    a.push(branch.to_string());
                }
                a
            }
            other => return ToolOutput::err(&call.id, format!("unsupported subcommand '{other}'")),
        };

        debug!(subcommand = %subcommand, "git tool");

        let mut cmd = Command::new("git");
        cmd.args(&args);
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        match cmd.output().await {
            Ok(output) => {
                let stdout = truncate(&String::from_utf8_lossy(&output.stdout), OUTPUT_LIMIT);
                let stderr = truncate(&String::from_utf8_lossy(&output.stderr), OUTPUT_LIMIT);
                let mut content = stdout;
                if !stderr.trim().is_empty() {
                    if !content.is_empty() { content.push('\n'); }
                    content.push_str(&stderr);
                }
                if output.status.success() {
                    ToolOutput::ok(&call.id, content)
                } else {
                    let code = output.status.code().unwrap_or(-1);
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        format!("{}...[truncated {} bytes]", &s[..limit], s.len() - limit)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::process::Command as StdCommand;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "g1".into(), name: "git".into(), args }
    }

    fn init_repo() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let dir = format!("/tmp/relay_git_test_{}_{n}", std::process::id());
        std::fs::create_dir_all(&dir).unwrap();
        StdCommand::new("git").arg("init").current_dir(&dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.email", "t@t.com"]).current_dir(&dir).output().unwrap();
        StdCommand::new("git").args(["config", "user.name", "t"]).current_dir(&dir).output().unwrap();
        dir
    }

    #[tokio::test]
    async fn status_on_fresh_repo() {
        let dir = init_repo();
        let t = GitTool;
        let out = t.execute(&call(json!({"subcommand": "status", "workdir": dir}))).await;
        assert!(!out.is_error, "{}", out.content);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn add_requires_explicit_paths() {
        let dir = init_repo();
        let t = GitTool;
        let out = t.execute(&call(json!({"subcommand": "add", "paths": [], "workdir": dir}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("refusing"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn add_then_commit() {
        let dir = init_repo();
        std::fs::write(format!("{dir}/a.txt"), "hello").unwrap();
        let t = GitTool;
        let added = t.execute(&call(json!({"subcommand": "add", "paths": ["a.txt"], "workdir": dir}))).await;
        assert!(!added.is_error, "{}", added.content);
        let committed = t.execute(&call(json!({"subcommand": "commit", "message": "add a.txt", "workdir": dir}))).await;
        assert!(!committed.is_error, "{}", committed.content);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn commit_requires_message() {
        let dir = init_repo();
        let t = GitTool;
        let out = t.execute(&call(json!({"subcommand": "commit", "workdir": dir}))).await;
        assert!(out.is_error);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unsupported_subcommand_is_error() {
        let t = GitTool;
        let out = t.execute(&call(json!({"subcommand": "reset"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("unsupported"));
    }

    #[tokio::test]
    async fn push_with_no_remote_fails_cleanly() {
        let dir = init_repo();
        let t = GitTool;
        // No remote configured in a fresh repo, so this exercises arg
        // construction and the non-zero-exit path rather than a real push.
        let out = t.execute(&call(json!({"subcommand": "push", "workdir": dir}))).await;
        assert!(out.is_error);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn only_available_in_agent_mode() {
        let t = GitTool;
        assert_eq!(t.modes(), &[AgentMode::Agent]);
    }
}
