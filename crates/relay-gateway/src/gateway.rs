// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway startup — assembles all subsystems and starts them.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order, then blocks on the HTTP server:
//!
//! 1. Construct a [`ControlService`] around the caller-supplied [`AgentFactory`].
//! 2. Load or generate the HTTP bearer token; print it **once** if new.
//! 3. Build the rate limiter, preference store, and shared [`AppState`].
//! 4. Start the Axum HTTP(S) server (blocks until shutdown).
//!
//! The gateway has no opinion on which model provider an agent talks to —
//! `factory` is supplied by the embedding application, which is also
//! responsible for loading provider credentials before constructing it.
//!
//! # Token management
//!
//! ```text
//! First start:  token generated -> SHA-256 hash stored in token.yaml
//!               raw token printed once (save it!)
//! Client:       Authorization: Bearer <token>
//! Rotate:       relay gateway regenerate-token
//!               old token immediately invalid
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::info;

use relay_core::{ProviderRouter, SessionStore};

use crate::{
    config::GatewayConfig,
    control::{AgentFactory, ControlService},
    crypto::token::StoredTokenFile,
    http::{
        preferences::PreferencesStore,
        rate_limit::ClientRateLimiter,
        AppState, ShutdownState,
    },
};

/// Provider set an embedding application hands to the gateway. Every
/// session's `Agent` routes its completions through `router` (see
/// `ControlService::get_or_create`), and `/stats`/`/metrics` read its
/// circuit-breaker state for the same provider set.
pub struct RouterHandle {
    pub router: Arc<ProviderRouter>,
    pub provider_names: Vec<String>,
}

/// Start the gateway, consuming an [`AgentFactory`] supplied by the caller.
///
/// `store`, when supplied, makes sessions durable across restarts — see
/// [`ControlService`]'s doc comment. Pass `None` to keep the prior
/// in-memory-only behavior.
///
/// Spawns the following tasks:
/// 1. `ControlService` — owns sessions, drives agent turns.
/// 2. Rate-limiter sweeper — periodically drops idle per-client buckets.
/// 3. HTTP server — accepts `/chat`, `/chat/stream`, `/ws`, `/sessions`, ... .
///
/// Runs until Ctrl+C, or the server's own shutdown deadline elapses while
/// draining.
pub async fn run(
    config: GatewayConfig,
    factory: AgentFactory,
    router: Option<RouterHandle>,
    store: Option<Arc<SessionStore>>,
) -> anyhow::Result<()> {
    // ── ControlService ───────────────────────────────────────────────────
    let (router, provider_names) = match router {
        Some(r) => (Some(r.router), r.provider_names),
        None => (None, Vec::new()),
    };
    let (service, agent_handle) = ControlService::new(factory, router.clone(), store);
    tokio::spawn(service.run());

    // ── Token ─────────────────────────────────────────────────────────────
    let token_path = config.http.token_file.clone().unwrap_or_else(default_token_path);
    let token_hash = if token_path.exists() {
        StoredTokenFile::load(&token_path)?.token_hash
    } else {
        info!("generating new gateway bearer token");
        let raw = StoredTokenFile::generate_and_save(&token_path)?;
        info!("=======================================================");
        info!("Gateway bearer token (shown once — save it now!):");
        info!("  {}", raw.as_str());
        info!("=======================================================");
        StoredTokenFile::load(&token_path)?.token_hash
    };

    // ── Shared state ──────────────────────────────────────────────────────
    let auth = crate::http::auth::AuthState::new(
        token_hash,
        config.http.auth_rate_limit_per_minute,
        config.http.auth_rate_burst,
    );

    let rate_limiter = Arc::new(ClientRateLimiter::default());
    rate_limiter.spawn_sweeper(Duration::from_secs(30 * 60));

    let state = AppState {
        agent: agent_handle,
        auth,
        rate_limiter,
        preferences: PreferencesStore::new(),
        router,
        provider_names: Arc::new(provider_names),
        shutdown: Arc::new(ShutdownState::default()),
    };

    // ── HTTP server (blocks until shutdown) ──────────────────────────────
    info!(
        bind = %config.http.bind,
        tls = !config.http.insecure_dev_mode,
        "starting HTTP gateway",
    );

    crate::http::serve(&config.http, state).await?;

    Ok(())
}

/// Regenerate the HTTP bearer token, printing the new raw token once.
pub fn regenerate_token(config: &GatewayConfig) -> anyhow::Result<()> {
    let token_path = config.http.token_file.clone().unwrap_or_else(default_token_path);
    let raw = StoredTokenFile::generate_and_save(&token_path)?;
    println!("New bearer token (save it now — it won't be shown again):");
    println!("  {}", raw.as_str());
    println!();
    println!("Usage:  Authorization: Bearer {}", raw.as_str());
    Ok(())
}

// ── Default paths ────────────────────────────────────────────────────────

pub fn default_token_path() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config/relay/gateway/token.yaml")
}
