// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP/WebSocket surface: router assembly, shared state, and the
//! server-level middleware stack (panic recovery, request logging, rate
//! limiting, security headers, CSRF, graceful shutdown).
//!
//! Endpoint handlers live in their own modules; this file only wires them
//! together and owns [`AppState`], the single state type threaded through
//! every extractor.

pub mod auth;
pub mod chat;
pub mod preferences;
pub mod rate_limit;
pub mod security;
pub mod sessions;
pub mod sse;
pub mod stats;
pub mod ws;

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use auth::{bearer_auth_mw, AsAuthState, AuthState};
use preferences::PreferencesStore;
use rate_limit::{rate_limit_mw, AsRateLimiter, ClientRateLimiter};
use relay_core::ProviderRouter;
use security::{csrf_guard, security_headers};

use crate::config::HttpConfig;
use crate::control::AgentHandle;

/// State threaded through every axum extractor. Cheap to clone — everything
/// behind it is already `Arc`'d or a `Sender`/`Handle`.
#[derive(Clone)]
pub struct AppState {
    pub agent: AgentHandle,
    pub auth: AuthState,
    pub rate_limiter: Arc<ClientRateLimiter>,
    pub preferences: Arc<PreferencesStore>,
    pub router: Option<Arc<ProviderRouter>>,
    pub provider_names: Arc<Vec<String>>,
    pub shutdown: Arc<ShutdownState>,
}

impl AsAuthState for AppState {
    fn auth_state(&self) -> &AuthState {
        &self.auth
    }
}

impl AsRateLimiter for AppState {
    fn rate_limiter(&self) -> &ClientRateLimiter {
        &self.rate_limiter
    }
}

/// Tracks in-flight requests so shutdown can refuse new work and wait for
/// what's already running to drain within a deadline.
#[derive(Default)]
pub struct ShutdownState {
    in_flight: AtomicUsize,
    draining: AtomicBool,
}

impl ShutdownState {
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every in-flight request has finished, or `deadline` elapses.
    pub async fn wait_drained(&self, deadline: Duration) {
        let start = tokio::time::Instant::now();
        while self.in_flight() > 0 {
            if start.elapsed() >= deadline {
                warn!(in_flight = self.in_flight(), "shutdown deadline reached with requests still in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn track_in_flight(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.shutdown.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    state.shutdown.in_flight.fetch_add(1, Ordering::SeqCst);
    let resp = next.run(req).await;
    state.shutdown.in_flight.fetch_sub(1, Ordering::SeqCst);
    resp
}

async fn health() -> &'static str {
    "ok"
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(sse::chat_stream))
        .route("/ws", get(ws::ws_handler))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session).delete(sessions::delete_session))
        .route("/sessions/:id/background", post(sessions::background_session))
        .route("/sessions/:id/activate", post(sessions::activate_session))
        .route("/preferences", get(preferences::get_global).post(preferences::set_global).put(preferences::set_global))
        .route(
            "/preferences/:scope",
            get(preferences::get_scoped).post(preferences::set_scoped).put(preferences::set_scoped),
        )
        .route("/stats", get(stats::stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_mw::<AppState>))
        .route_layer(middleware::from_fn_with_state(state.clone(), bearer_auth_mw::<AppState>));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(stats::metrics))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), track_in_flight))
        .layer(middleware::from_fn(csrf_guard))
        .layer(middleware::from_fn(security_headers))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn handle_panic(_: Box<dyn std::any::Any + Send>) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

/// Bind and run the HTTP server until it's told to shut down.
///
/// TLS is used unless `config.insecure_dev_mode` is set, in which case the
/// gateway serves plain HTTP — only intended for loopback development.
pub async fn serve(config: &HttpConfig, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    let shutdown = state.shutdown.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining in-flight requests");
        shutdown.begin_drain();
        shutdown.wait_drained(Duration::from_secs(30)).await;
    };

    if config.insecure_dev_mode {
        warn!(%addr, "serving HTTP without TLS (insecure_dev_mode)");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal).await?;
    } else {
        let cert = config.tls_cert_file.as_deref().ok_or_else(|| {
            anyhow::anyhow!("tls_cert_file is required unless insecure_dev_mode is set")
        })?;
        let key = config.tls_key_file.as_deref().ok_or_else(|| {
            anyhow::anyhow!("tls_key_file is required unless insecure_dev_mode is set")
        })?;
        let tls_config = load_tls_config(cert, key).await?;
        info!(%addr, "serving HTTPS");
        axum_server::bind_rustls(addr, tls_config)
            .serve(app)
            .await?;
    }

    Ok(())
}

async fn load_tls_config(
    cert: &Path,
    key: &Path,
) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| anyhow::anyhow!("loading TLS cert/key: {e}"))
}
