// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Type conversions between rmcp's MCP model types and relay's tool types.
//!
//! These are pure, stateless functions — no allocation beyond what the output
//! types require.  The bridge sits at the seam between an external MCP
//! server's wire protocol and the [`relay_tools::Tool`] contract so the rest
//! of the gateway never has to know a given tool call is actually proxied
//! over a child process.

use rmcp::model::{CallToolResult, Content, RawContent, Tool as McpTool};
use serde_json::Value;

use relay_tools::{ToolOutput, ToolOutputPart};

/// Convert an rmcp [`Tool`](McpTool) descriptor (as returned by a server's
/// `tools/list`) into the JSON Schema relay tools expose via
/// [`relay_tools::Tool::parameters_schema`].
///
/// The MCP `input_schema` is already valid JSON Schema, so it passes through
/// unchanged; only the envelope (name, description) is restructured.
pub fn mcp_tool_schema(tool: &McpTool) -> Value {
    Value::Object((*tool.input_schema).clone())
}

/// Convert an rmcp [`CallToolResult`] into relay's [`ToolOutput`].
///
/// Text content becomes [`ToolOutputPart::Text`]; image content is re-encoded
/// as a `data:<mime>;base64,<data>` URI and becomes [`ToolOutputPart::Image`].
/// Any other content type (audio, embedded resources) is rendered as a short
/// text placeholder rather than dropped silently.
pub fn call_result_to_output(call_id: &str, result: CallToolResult) -> ToolOutput {
    let is_error = result.is_error.unwrap_or(false);
    let parts: Vec<ToolOutputPart> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => ToolOutputPart::Text(t.text),
            RawContent::Image(img) => {
                ToolOutputPart::Image(format!("data:{};base64,{}", img.mime_type, img.data))
            }
            RawContent::Audio(_) => ToolOutputPart::Text("[audio content omitted]".to_string()),
            RawContent::Resource(r) => {
                ToolOutputPart::Text(format!("[embedded resource: {:?}]", r.resource))
            }
            RawContent::ResourceLink(link) => {
                ToolOutputPart::Text(format!("[resource link: {}]", link.uri))
            }
        })
        .collect();

    let output = ToolOutput::with_parts(call_id, parts);
    if is_error {
        ToolOutput { is_error: true, ..output }
    } else {
        output
    }
}

/// Helper used by server-facing tests and the mock transport: build a plain
/// text [`CallToolResult`] the way a real MCP server would.
#[cfg(test)]
fn text_result(text: &str, is_error: bool) -> CallToolResult {
    if is_error {
        CallToolResult {
            content: vec![Content::text(text)],
            is_error: Some(true),
            structured_content: None,
            meta: None,
        }
    } else {
        CallToolResult::success(vec![Content::text(text)])
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn call_result_to_output_text_success() {
        let result = text_result("hello world", false);
        let out = call_result_to_output("id1", result);
        assert!(!out.is_error);
        assert_eq!(out.content, "hello world");
    }

    #[test]
    fn call_result_to_output_error_flag_set() {
        let result = text_result("boom", true);
        let out = call_result_to_output("id2", result);
        assert!(out.is_error);
        assert_eq!(out.content, "boom");
    }

    #[test]
    fn call_result_to_output_image_becomes_data_uri() {
        let result = CallToolResult::success(vec![Content::image(
            "AAAA".to_string(),
            "image/png".to_string(),
        )]);
        let out = call_result_to_output("id3", result);
        assert!(out.has_images());
        assert!(matches!(&out.parts[0], ToolOutputPart::Image(uri) if uri == "data:image/png;base64,AAAA"));
    }

    #[test]
    fn call_result_to_output_mixed_parts_preserves_count() {
        let result = CallToolResult::success(vec![
            Content::text("prefix"),
            Content::image("xyz".to_string(), "image/jpeg".to_string()),
            Content::text("suffix"),
        ]);
        let out = call_result_to_output("id4", result);
        assert_eq!(out.parts.len(), 3);
    }

    #[test]
    fn mcp_tool_schema_passes_object_through() {
        let tool = McpTool::new(
            std::borrow::Cow::Borrowed("grep"),
            std::borrow::Cow::Borrowed("Greps files"),
            std::sync::Arc::new(
                json!({"type": "object", "properties": {"pattern": {"type": "string"}}})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        );
        let schema = mcp_tool_schema(&tool);
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["pattern"].is_object());
    }
}
