// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `/preferences[/scope]` — small, scoped key-value store for client-facing
//! settings (default mode, default provider, approval policy overrides) that
//! don't belong in `relay_config::Config` because they're set by a client at
//! runtime rather than loaded from a config file.
//!
//! Scopes are opaque strings the caller defines; `"global"` is used when no
//! scope is given. There's no schema beyond "valid JSON object" — this
//! mirrors how loosely `relay_config::ToolsConfig` treats its own nested
//! maps, just without the config file round-trip.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::http::AppState;

const GLOBAL_SCOPE: &str = "global";

/// In-memory preference store, one JSON object per scope. Not persisted
/// across restarts — callers that need durability should fold their
/// preferences into `relay_config::Config` instead.
#[derive(Default)]
pub struct PreferencesStore {
    scopes: Mutex<HashMap<String, Value>>,
}

impl PreferencesStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn get(&self, scope: &str) -> Value {
        self.scopes.lock().await.get(scope).cloned().unwrap_or_else(|| Value::Object(Default::default()))
    }

    async fn set(&self, scope: &str, value: Value) {
        self.scopes.lock().await.insert(scope.to_string(), value);
    }
}

pub async fn get_global(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.preferences.get(GLOBAL_SCOPE).await)
}

pub async fn get_scoped(State(state): State<AppState>, Path(scope): Path<String>) -> impl IntoResponse {
    Json(state.preferences.get(&scope).await)
}

pub async fn set_global(State(state): State<AppState>, Json(value): Json<Value>) -> impl IntoResponse {
    state.preferences.set(GLOBAL_SCOPE, value).await;
    StatusCode::NO_CONTENT
}

pub async fn set_scoped(
    State(state): State<AppState>,
    Path(scope): Path<String>,
    Json(value): Json<Value>,
) -> impl IntoResponse {
    state.preferences.set(&scope, value).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unset_scope_returns_empty_object() {
        let store = PreferencesStore::new();
        assert_eq!(store.get("anything").await, Value::Object(Default::default()));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = PreferencesStore::new();
        store.set("global", serde_json::json!({ "mode": "agent" })).await;
        assert_eq!(store.get("global").await, serde_json::json!({ "mode": "agent" }));
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let store = PreferencesStore::new();
        store.set("a", serde_json::json!({ "x": 1 })).await;
        store.set("b", serde_json::json!({ "x": 2 })).await;
        assert_eq!(store.get("a").await, serde_json::json!({ "x": 1 }));
        assert_eq!(store.get("b").await, serde_json::json!({ "x": 2 }));
    }
}
