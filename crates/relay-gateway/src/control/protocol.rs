// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between HTTP/WebSocket clients and the [`super::service::ControlService`].
//!
//! `ControlCommand` is what a client sends; `ControlEvent` is what it
//! receives back. Both are plain JSON over the WebSocket and map directly
//! onto the SSE event stream used by the `chat/stream` endpoint.

use serde::{Deserialize, Serialize};

use relay_core::AgentEvent;

/// A command sent by a client to drive a session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Submit a new user turn to a session, creating it first if `session_id`
    /// is not yet known to the service.
    Submit {
        session_id: String,
        text: String,
        /// Working directory new sessions are created with. Ignored once the
        /// session already exists.
        #[serde(default)]
        working_dir: Option<String>,
        /// Provider name to prefer for this turn's completions, forwarded to
        /// `ProviderRouter::route` as `preferred_provider`. `None` leaves the
        /// agent's current model/provider in place.
        #[serde(default)]
        preferred_provider: Option<String>,
        /// Opaque caller identity, surfaced back through `SessionInfo`.
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Cancel the in-flight turn for a session, if any.
    Cancel { session_id: String },
    /// List all known sessions.
    ListSessions,
    /// Move a session out of the active set so it stops counting against
    /// anything that caps concurrently-active sessions.
    Background { session_id: String },
    /// Move a session back into the active set, optionally reassigning its
    /// client identity.
    Activate {
        session_id: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Forget a session entirely.
    DeleteSession { session_id: String },
}

/// An event sent from the service to a client.
///
/// Every variant except `GatewayError` carries the `session_id` it
/// originated from, since one WebSocket connection may be subscribed to
/// events from several sessions at once.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Forwarded verbatim from the agent loop.
    Agent {
        session_id: String,
        #[serde(flatten)]
        event: SerializableAgentEvent,
    },
    SessionList { sessions: Vec<SessionInfo> },
    GatewayError { code: u32, message: String },
}

/// Summary of a tracked session, as returned by `ListSessions` and the
/// `/sessions` HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub turn_count: usize,
    pub token_count: usize,
    pub max_tokens: usize,
    pub working_dir: String,
    pub client_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Number of stored messages per role, keyed by `relay_model::Role`'s
    /// snake_case wire name (`user`, `assistant`, `system`, `tool`).
    pub message_counts: std::collections::BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Background,
    Cancelled,
    Errored,
}

/// JSON-friendly mirror of [`relay_core::AgentEvent`].
///
/// `AgentEvent` itself doesn't derive `Serialize` (it's an internal type
/// shared with the TUI-style consumers in `relay-core`), so this adapter
/// owns the wire representation instead of forcing a serde dependency onto
/// the core crate's event enum.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SerializableAgentEvent {
    TextDelta { text: String },
    TextComplete { text: String },
    ThinkingDelta { text: String },
    ThinkingComplete { text: String },
    ToolCallStarted { call_id: String, tool_name: String },
    ToolCallFinished { call_id: String, tool_name: String, output: String, is_error: bool },
    ContextCompacted { tokens_before: usize, tokens_after: usize },
    TokenUsage {
        input: u32,
        output: u32,
        cache_read: u32,
        cache_write: u32,
        cache_read_total: u64,
        cache_write_total: u64,
        max_tokens: usize,
    },
    TurnComplete,
    Error { message: String },
    TodoUpdate { count: usize },
    ModeChanged { mode: String },
    Question { id: String, questions: Vec<String> },
    QuestionAnswer { id: String, answer: String },
    Aborted { partial_text: String },
}

impl From<&AgentEvent> for SerializableAgentEvent {
    fn from(ev: &AgentEvent) -> Self {
        match ev {
            AgentEvent::TextDelta(s) => Self::TextDelta { text: s.clone() },
            AgentEvent::TextComplete(s) => Self::TextComplete { text: s.clone() },
            AgentEvent::ThinkingDelta(s) => Self::ThinkingDelta { text: s.clone() },
            AgentEvent::ThinkingComplete(s) => Self::ThinkingComplete { text: s.clone() },
            AgentEvent::ToolCallStarted(call) => Self::ToolCallStarted {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
            },
            AgentEvent::ToolCallFinished { call_id, tool_name, output, is_error } => {
                Self::ToolCallFinished {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    output: output.clone(),
                    is_error: *is_error,
                }
            }
            AgentEvent::ContextCompacted { tokens_before, tokens_after } => {
                Self::ContextCompacted { tokens_before: *tokens_before, tokens_after: *tokens_after }
            }
            AgentEvent::TokenUsage {
                input, output, cache_read, cache_write, cache_read_total, cache_write_total, max_tokens,
            } => Self::TokenUsage {
                input: *input,
                output: *output,
                cache_read: *cache_read,
                cache_write: *cache_write,
                cache_read_total: *cache_read_total,
                cache_write_total: *cache_write_total,
                max_tokens: *max_tokens,
            },
            AgentEvent::TurnComplete => Self::TurnComplete,
            AgentEvent::Error(msg) => Self::Error { message: msg.clone() },
            AgentEvent::TodoUpdate(items) => Self::TodoUpdate { count: items.len() },
            AgentEvent::ModeChanged(mode) => Self::ModeChanged { mode: format!("{mode:?}") },
            AgentEvent::Question { id, questions } => {
                Self::Question { id: id.clone(), questions: questions.clone() }
            }
            AgentEvent::QuestionAnswer { id, answer } => {
                Self::QuestionAnswer { id: id.clone(), answer: answer.clone() }
            }
            AgentEvent::Aborted { partial_text } => {
                Self::Aborted { partial_text: partial_text.clone() }
            }
        }
    }
}
