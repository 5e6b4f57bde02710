// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use relay_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Dry-run counterpart to write/edit_file: computes and returns a unified
/// diff of what the write or edit WOULD do, without touching the filesystem.
///
/// Useful for agent modes (e.g. Plan/Chat) that may propose a change for a
/// human to approve before the write/edit_file tool — which does mutate — is
/// ever called.
pub struct PreviewTool;

#[async_trait]
impl Tool for PreviewTool {
    fn name(&self) -> &str { "preview" }

    fn description(&self) -> &str {
        "Shows a unified diff of a proposed file write or edit without making any changes. \
         action=write: diffs 'content' against the existing file at 'path' (or against an empty \
         file if it doesn't exist yet). \
         action=edit: diffs the existing file with 'old_string' replaced by 'new_string'. \
         Always read-only — use write or edit_file to actually apply the change."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["write", "edit"] },
                "path": { "type": "string", "description": "File to preview against" },
                "content": { "type": "string", "description": "New full content (action=write)" },
                "old_string": { "type": "string", "description": "Text to replace (action=edit)" },
                "new_string": { "type": "string", "description": "Replacement text (action=edit)" }
            },
            "required": ["action", "path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }

    fn modes(&self) -> &[AgentMode] { &[AgentMode::Agent, AgentMode::Plan] }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let action = match call.args.get("action").and_then(|v| v.as_str()) {
            Some(a) => a,
            None => return ToolOutput::err(&call.id, "missing 'action' argument"),
        };
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'path' argument"),
        };

        let original = tokio::fs::read_to_string(&path).await.unwrap_or_default();

        let proposed = match action {
            "write" => match call.args.get("content").and_then(|v| v.as_str()) {
                Some(c) => c.to_string(),
                None => return ToolOutput::err(&call.id, "missing 'content' argument"),
            },
            "edit" => {
                let old_string = match call.args.get("old_string").and_then(|v| v.as_str()) {
                    Some(s) => s,
                    None => return ToolOutput::err(&call.id, "missing 'old_string' argument"),
                };
                let new_string = match call.args.get("new_string").and_then(|v| v.as_str()) {
                    Some(s) => s,
                    None => return ToolOutput::err(&call.id, "missing 'new_string' argument"),
                };
                if !original.contains(old_string) {
                    return ToolOutput::err(&call.id, format!("'old_string' not found in {path}"));
                }
                original.replacen(old_string, new_string, 1)
            }
            other => return ToolOutput::err(&call.id, format!("unknown action '{other}'")),
        };

        debug!(path = %path, action, "preview tool");

        if original == proposed {
            return ToolOutput::ok(&call.id, "no changes".to_string());
        }

        let diff = TextDiff::from_lines(&original, &proposed);
        let unified = diff
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{path}"), &format!("b/{path}"))
            .to_string();

        ToolOutput::ok(&call.id, unified)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tool::{Tool, ToolCall};

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "p1".into(), name: "preview".into(), args }
    }

    fn tmp_path() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/relay_preview_test_{}_{n}.txt", std::process::id())
    }

    #[tokio::test]
    async fn preview_write_against_new_file_shows_additions() {
        let path = tmp_path();
        let t = PreviewTool;
        let out = t.execute(&call(json!({"action": "write", "path": path, "content": "hello\n"}))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("+hello"));
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn preview_edit_shows_replacement() {
        let path = tmp_path();
        std::fs::write(&path, "foo bar baz\n").unwrap();
        let t = PreviewTool;
        let out = t.execute(&call(json!({
            "action": "edit", "path": path, "old_string": "bar", "new_string": "qux"
        }))).await;
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("-foo bar baz"));
        assert!(out.content.contains("+foo qux baz"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo bar baz\n");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn preview_edit_missing_old_string_is_error() {
        let path = tmp_path();
        std::fs::write(&path, "content\n").unwrap();
        let t = PreviewTool;
        let out = t.execute(&call(json!({
            "action": "edit", "path": path, "old_string": "nope", "new_string": "x"
        }))).await;
        assert!(out.is_error);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn no_changes_reports_clean() {
        let path = tmp_path();
        std::fs::write(&path, "same\n").unwrap();
        let t = PreviewTool;
        let out = t.execute(&call(json!({"action": "write", "path": path, "content": "same\n"}))).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "no changes");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn available_in_agent_and_plan_modes() {
        let t = PreviewTool;
        assert_eq!(t.modes(), &[AgentMode::Agent, AgentMode::Plan]);
    }
}
