// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! General per-client request rate limiter, keyed by source IP (and, when
//! present, the session a request names) rather than the raw TCP peer.
//!
//! Separate from [`crate::http::auth::AuthState`]'s limiter, which only
//! throttles *failed* authentication attempts. This one gates every request
//! that reaches an authenticated handler, so a single misbehaving client
//! can't starve the gateway for everyone else. Same `governor` keyed-GCRA
//! shape as the auth limiter, generalized to any request.

use std::{
    collections::HashMap,
    net::IpAddr,
    num::NonZeroU32,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use serde::Serialize;
use tracing::warn;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Header a reverse proxy sets with the original client address. Trusted
/// blindly here — the gateway assumes it sits behind a proxy that either
/// sets this itself or strips any client-supplied value before forwarding.
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Header a client may set to scope its own rate-limit bucket to a session
/// rather than its source IP — useful behind a NAT or shared proxy where
/// many distinct sessions would otherwise share one bucket.
const SESSION_ID_HEADER: &str = "x-relay-session-id";

/// Per-client token bucket, keyed by `{ip}` or `{ip}:{session_id}` when a
/// session id header is present. Default: 10 requests/sec, burst of 20.
pub struct ClientRateLimiter {
    limiter: KeyedLimiter,
    per_second: u32,
    burst: u32,
    /// Last-seen time per key, maintained alongside `limiter` purely for the
    /// `active_clients` count in [`Self::stats`] — `governor`'s keyed store
    /// doesn't expose its own entry count.
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ClientRateLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).expect("per_second must be > 0"))
            .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));
        Self {
            limiter: RateLimiter::keyed(quota),
            per_second,
            burst,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Periodically drop state for clients that haven't been seen recently,
    /// so a gateway with many transient clients doesn't grow its keyed-state
    /// map without bound. `governor`'s keyed stores track idle entries
    /// internally; this just drives the sweep on a schedule, and prunes the
    /// `last_seen` tracking map on the same cadence.
    pub fn spawn_sweeper(self: &Arc<Self>, sweep_every: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                this.limiter.retain_recent();
                let cutoff = Instant::now() - sweep_every;
                this.last_seen.lock().unwrap().retain(|_, seen| *seen >= cutoff);
            }
        });
    }

    fn check(&self, key: &str) -> bool {
        self.last_seen.lock().unwrap().insert(key.to_string(), Instant::now());
        self.limiter.check_key(&key.to_string()).is_ok()
    }

    /// Snapshot of the limiter's configuration and live bucket count, for
    /// `/stats` and `/metrics`.
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            per_second: self.per_second,
            burst: self.burst,
            active_clients: self.last_seen.lock().unwrap().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterStats {
    pub per_second: u32,
    pub burst: u32,
    /// Number of distinct client keys with a live bucket. Falls as buckets
    /// go idle and [`ClientRateLimiter::spawn_sweeper`] reclaims them.
    pub active_clients: usize,
}

impl Default for ClientRateLimiter {
    /// 10 requests/sec, burst of 20, matching the gateway's default request
    /// rate policy.
    fn default() -> Self {
        Self::new(10, 20)
    }
}

/// Default interval between idle-entry sweeps. Entries whose bucket has been
/// fully idle past `governor`'s own retention window (bounded by the quota's
/// replenishment period) are dropped on each sweep, which keeps long-running
/// gateways from slowly leaking memory across a 30-minute client churn cycle.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub trait AsRateLimiter {
    fn rate_limiter(&self) -> &ClientRateLimiter;
}

/// Axum middleware: reject with `429` once a client's bucket is empty.
pub async fn rate_limit_mw<S>(
    State(state): State<S>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    req: Request,
    next: Next,
) -> Response
where
    S: AsRateLimiter + Clone + Send + Sync + 'static,
{
    let ip = client_ip(req.headers()).unwrap_or_else(|| addr.ip());
    let key = rate_limit_key(ip, req.headers());
    let limiter = state.rate_limiter();
    if limiter.check(&key) {
        next.run(req).await
    } else {
        warn!(key = %key, "request rate limit exceeded");
        (StatusCode::TOO_MANY_REQUESTS, [(axum::http::header::RETRY_AFTER, "1")], "Too Many Requests")
            .into_response()
    }
}

/// Extract the original client IP from `X-Forwarded-For` (the first,
/// left-most address in the comma-separated chain), falling back to the
/// `ConnectInfo` peer address when the header is absent or unparseable.
fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(FORWARDED_FOR_HEADER)?.to_str().ok()?;
    value.split(',').next()?.trim().parse().ok()
}

fn rate_limit_key(ip: IpAddr, headers: &HeaderMap) -> String {
    match headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(session_id) if !session_id.is_empty() => format!("{ip}:{session_id}"),
        _ => ip.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
