// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `/sessions` CRUD and lifecycle transitions.
//!
//! All of these round-trip through `ControlService` the same way `/chat`
//! does: send a command, then wait on the broadcast for the matching
//! reply. There's no direct access to session state from an HTTP handler —
//! the service is the only task allowed to touch a `Session`.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::control::protocol::{ControlCommand, ControlEvent, SessionInfo};
use crate::http::AppState;

const REPLY_WAIT: Duration = Duration::from_secs(5);

pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let mut events = state.agent.subscribe();
    if state.agent.send(ControlCommand::ListSessions).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(Vec::<SessionInfo>::new()));
    }
    match wait_for_session_list(&mut events).await {
        Some(sessions) => (StatusCode::OK, Json(sessions)),
        None => (StatusCode::GATEWAY_TIMEOUT, Json(Vec::new())),
    }
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let mut events = state.agent.subscribe();
    if state.agent.send(ControlCommand::ListSessions).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(None::<SessionInfo>));
    }
    match wait_for_session_list(&mut events).await {
        Some(sessions) => match sessions.into_iter().find(|s| s.id == id) {
            Some(info) => (StatusCode::OK, Json(Some(info))),
            None => (StatusCode::NOT_FOUND, Json(None)),
        },
        None => (StatusCode::GATEWAY_TIMEOUT, Json(None)),
    }
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    dispatch_and_confirm(&state, ControlCommand::DeleteSession { session_id: id }).await
}

pub async fn background_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    dispatch_and_confirm(&state, ControlCommand::Background { session_id: id }).await
}

#[derive(Debug, Deserialize, Default)]
pub struct ActivateRequest {
    pub client_id: Option<String>,
}

pub async fn activate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ActivateRequest>>,
) -> impl IntoResponse {
    let client_id = body.map(|Json(b)| b.client_id).unwrap_or_default();
    dispatch_and_confirm(&state, ControlCommand::Activate { session_id: id, client_id }).await
}

/// Send a command that has no dedicated success reply, then watch the
/// broadcast briefly for a `GatewayError` naming this session before
/// assuming it went through.
async fn dispatch_and_confirm(state: &AppState, cmd: ControlCommand) -> (StatusCode, Json<serde_json::Value>) {
    let mut events = state.agent.subscribe();
    if state.agent.send(cmd).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "error": "control service unavailable" })));
    }

    match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        Ok(Ok(ControlEvent::GatewayError { code, message })) => {
            let status = StatusCode::from_u16(code as u16).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(serde_json::json!({ "error": message })))
        }
        _ => (StatusCode::OK, Json(serde_json::json!({ "ok": true }))),
    }
}

async fn wait_for_session_list(events: &mut broadcast::Receiver<ControlEvent>) -> Option<Vec<SessionInfo>> {
    for _ in 0..20 {
        match tokio::time::timeout(REPLY_WAIT, events.recv()).await {
            Ok(Ok(ControlEvent::SessionList { sessions })) => return Some(sessions),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
    None
}
