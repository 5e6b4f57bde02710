// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `POST /chat` — non-streaming chat turn.
//!
//! Submits the turn to the `ControlService`, then waits on the event
//! broadcast for that session's terminal event (`TurnComplete`, `Error`, or
//! `Aborted`), collecting the final assistant text along the way. Clients
//! that want incremental output should use `/chat/stream` or `/ws` instead.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::control::{
    protocol::{ControlCommand, ControlEvent, SerializableAgentEvent, SessionInfo},
    service::AgentHandle,
};
use crate::http::AppState;

/// Requests that hear nothing back within this deadline are reported as a
/// gateway timeout rather than hanging the connection indefinitely.
const CHAT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub user_input: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Forwarded as `ProviderRouter::route`'s `preferred_provider` for this
    /// turn (see `ControlCommand::Submit::preferred_provider`).
    pub provider: Option<String>,
    /// Accepted for API compatibility with clients that specify a model
    /// alongside a provider; the gateway selects a provider's chain, not a
    /// specific model within it, so this is not yet wired to anything.
    pub model: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
}

fn default_working_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub result: String,
    pub session_info: Option<SessionInfo>,
    pub error: Option<String>,
}

pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> impl IntoResponse {
    let session_id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut events = state.agent.subscribe();
    if let Err(e) = state
        .agent
        .send(ControlCommand::Submit {
            session_id: session_id.clone(),
            text: req.user_input,
            working_dir: Some(req.working_dir),
            preferred_provider: req.provider,
            client_id: None,
        })
        .await
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ChatResponse { session_id, result: String::new(), session_info: None, error: Some(e.to_string()) }),
        );
    }

    let mut response = await_turn(&mut events, &session_id).await;
    response.session_info = fetch_session_info(&state.agent, &session_id).await;

    let status = if response.error.is_some() { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
    (status, Json(response))
}

/// Drain `events` until the submitted turn for `session_id` reaches a
/// terminal state, accumulating the final assistant text along the way.
async fn await_turn(events: &mut broadcast::Receiver<ControlEvent>, session_id: &str) -> ChatResponse {
    let mut result = String::new();
    let deadline = tokio::time::Instant::now() + CHAT_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return ChatResponse {
                session_id: session_id.to_string(),
                result,
                session_info: None,
                error: Some("timed out waiting for turn completion".to_string()),
            };
        }

        let event = match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(ev)) => ev,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                return ChatResponse {
                    session_id: session_id.to_string(),
                    result,
                    session_info: None,
                    error: Some("control service stopped responding".to_string()),
                };
            }
        };

        let ControlEvent::Agent { session_id: sid, event } = event else { continue };
        if sid != session_id {
            continue;
        }

        match event {
            SerializableAgentEvent::TextComplete { text } => result = text,
            SerializableAgentEvent::Aborted { partial_text } => {
                return ChatResponse {
                    session_id: session_id.to_string(),
                    result: partial_text,
                    session_info: None,
                    error: Some("turn was cancelled".to_string()),
                };
            }
            SerializableAgentEvent::Error { message } => {
                return ChatResponse { session_id: session_id.to_string(), result, session_info: None, error: Some(message) };
            }
            SerializableAgentEvent::TurnComplete => {
                return ChatResponse { session_id: session_id.to_string(), result, session_info: None, error: None };
            }
            _ => {}
        }
    }
}

async fn fetch_session_info(agent: &AgentHandle, session_id: &str) -> Option<SessionInfo> {
    let mut events = agent.subscribe();
    agent.send(ControlCommand::ListSessions).await.ok()?;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(ControlEvent::SessionList { sessions })) => {
                return sessions.into_iter().find(|s| s.id == session_id);
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    None
}
