// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `POST /chat/stream` — server-sent events stream of progress for one turn.
//!
//! Built from the same `AgentHandle` broadcast `ws.rs` bridges to
//! WebSocket clients, filtered down to one session and mapped onto the
//! `{type, ...}` SSE payload shape: `turn_start`, `tool_start`, `tool_end`,
//! `error`, `done`. Unknown future event kinds are simply skipped rather
//! than breaking the stream, so older clients keep working as new
//! `AgentEvent` variants are added.

use std::pin::Pin;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::control::protocol::{ControlCommand, ControlEvent, SerializableAgentEvent};
use crate::http::{chat::ChatRequest, AppState};

type BoxedStream = Pin<Box<dyn Stream<Item = Result<Event, std::convert::Infallible>> + Send>>;

#[derive(Debug, Serialize)]
struct SsePayload {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    data: serde_json::Value,
}

pub async fn chat_stream(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Sse<BoxedStream> {
    let session_id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let events = state.agent.subscribe();

    let submit_result = state
        .agent
        .send(ControlCommand::Submit {
            session_id: session_id.clone(),
            text: req.user_input,
            working_dir: Some(req.working_dir),
            preferred_provider: req.provider,
            client_id: None,
        })
        .await;

    if let Err(e) = submit_result {
        let payload = SsePayload { kind: "error", data: json!({ "message": e.to_string() }) };
        let one_shot = stream::once(async move { Ok(to_event(&payload)) });
        return Sse::new(Box::pin(one_shot) as BoxedStream).keep_alive(KeepAlive::default());
    }

    let start = SsePayload { kind: "turn_start", data: json!({ "session_id": session_id }) };
    let head = stream::once(async move { Ok(to_event(&start)) });

    let body = stream::unfold((events, session_id, false), |(mut rx, sid, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(ControlEvent::Agent { session_id: esid, event }) if esid == sid => {
                    if let Some((ev, terminal)) = translate(event) {
                        return Some((Ok(ev), (rx, sid, terminal)));
                    }
                    continue;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    let payload = SsePayload { kind: "done", data: json!({}) };
                    return Some((Ok(to_event(&payload)), (rx, sid, true)));
                }
            }
        }
    });

    Sse::new(Box::pin(head.chain(body)) as BoxedStream).keep_alive(KeepAlive::default())
}

fn translate(event: SerializableAgentEvent) -> Option<(Event, bool)> {
    let (kind, data, terminal): (&'static str, serde_json::Value, bool) = match event {
        SerializableAgentEvent::ToolCallStarted { call_id, tool_name } => {
            ("tool_start", json!({ "call_id": call_id, "tool_name": tool_name }), false)
        }
        SerializableAgentEvent::ToolCallFinished { call_id, tool_name, output, is_error } => (
            "tool_end",
            json!({ "call_id": call_id, "tool_name": tool_name, "output": output, "is_error": is_error }),
            false,
        ),
        SerializableAgentEvent::Error { message } => ("error", json!({ "message": message }), true),
        SerializableAgentEvent::Aborted { partial_text } => {
            ("done", json!({ "result": partial_text, "cancelled": true }), true)
        }
        SerializableAgentEvent::TurnComplete => ("done", json!({}), true),
        SerializableAgentEvent::TextDelta { text } => ("text_delta", json!({ "text": text }), false),
        _ => return None,
    };
    let payload = SsePayload { kind, data };
    Some((to_event(&payload), terminal))
}

fn to_event(payload: &SsePayload) -> Event {
    Event::default().event(payload.kind).json_data(payload).unwrap_or_else(|_| Event::default().event("error"))
}
