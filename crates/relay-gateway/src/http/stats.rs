// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `GET /stats` (JSON) and `GET /metrics` (Prometheus text exposition).
//!
//! Reports session counts by state and, when the gateway was built with a
//! `ProviderRouter`, each registered provider's circuit-breaker state. No
//! cost or token-spend tables — `relay_model::catalog` carries no pricing
//! data, and the gateway stays out of cost accounting by design.

use std::time::Duration;

use axum::{extract::State, response::IntoResponse};
use relay_core::CircuitState;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::control::protocol::{ControlCommand, ControlEvent, SessionState};
use crate::http::rate_limit::RateLimiterStats;
use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct Stats {
    pub sessions_total: usize,
    pub sessions_by_state: SessionStateCounts,
    pub providers: Vec<ProviderStats>,
    pub rate_limiter: RateLimiterStats,
}

#[derive(Debug, Default, Serialize)]
pub struct SessionStateCounts {
    pub idle: usize,
    pub running: usize,
    pub background: usize,
    pub cancelled: usize,
    pub errored: usize,
}

#[derive(Debug, Serialize)]
pub struct ProviderStats {
    pub name: String,
    pub circuit_state: String,
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut events = state.agent.subscribe();
    let sessions = if state.agent.send(ControlCommand::ListSessions).await.is_ok() {
        collect_session_list(&mut events).await.unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut by_state = SessionStateCounts::default();
    for s in &sessions {
        match s.state {
            SessionState::Idle => by_state.idle += 1,
            SessionState::Running => by_state.running += 1,
            SessionState::Background => by_state.background += 1,
            SessionState::Cancelled => by_state.cancelled += 1,
            SessionState::Errored => by_state.errored += 1,
        }
    }

    let mut providers = Vec::new();
    if let Some(router) = &state.router {
        for name in &state.provider_names {
            let circuit = router.circuit_state(name).await.unwrap_or(CircuitState::Closed);
            providers.push(ProviderStats { name: name.clone(), circuit_state: format!("{circuit:?}") });
        }
    }

    axum::Json(Stats {
        sessions_total: sessions.len(),
        sessions_by_state: by_state,
        providers,
        rate_limiter: state.rate_limiter.stats(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut events = state.agent.subscribe();
    let sessions = if state.agent.send(ControlCommand::ListSessions).await.is_ok() {
        collect_session_list(&mut events).await.unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut out = String::new();
    out.push_str("# HELP relay_gateway_sessions_total Number of tracked sessions.\n");
    out.push_str("# TYPE relay_gateway_sessions_total gauge\n");
    out.push_str(&format!("relay_gateway_sessions_total {}\n", sessions.len()));

    out.push_str("# HELP relay_gateway_sessions_running Sessions with a turn in flight.\n");
    out.push_str("# TYPE relay_gateway_sessions_running gauge\n");
    let running = sessions.iter().filter(|s| s.state == SessionState::Running).count();
    out.push_str(&format!("relay_gateway_sessions_running {running}\n"));

    if let Some(router) = &state.router {
        out.push_str("# HELP relay_gateway_provider_circuit_open Whether a provider's circuit breaker is open (1) or not (0).\n");
        out.push_str("# TYPE relay_gateway_provider_circuit_open gauge\n");
        for name in &state.provider_names {
            let open = matches!(router.circuit_state(name).await, Some(CircuitState::Open));
            out.push_str(&format!("relay_gateway_provider_circuit_open{{provider=\"{name}\"}} {}\n", open as u8));
        }
    }

    let rl = state.rate_limiter.stats();
    out.push_str("# HELP relay_gateway_rate_limit_active_clients Distinct client keys with a live rate-limit bucket.\n");
    out.push_str("# TYPE relay_gateway_rate_limit_active_clients gauge\n");
    out.push_str(&format!("relay_gateway_rate_limit_active_clients {}\n", rl.active_clients));

    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], out)
}

async fn collect_session_list(
    events: &mut broadcast::Receiver<ControlEvent>,
) -> Option<Vec<crate::control::protocol::SessionInfo>> {
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(ControlEvent::SessionList { sessions })) => return Some(sessions),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
    None
}
