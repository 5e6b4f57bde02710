// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Provider router: response cache, in-flight dedup, retry with jittered
//! backoff, and a per-provider circuit breaker, sitting in front of a chain
//! of [`relay_model::ModelProvider`]s.
//!
//! Grounded on the retry/backoff shape in a provider adapter's own transient-
//! error handling (`is_retryable_status` + exponential backoff) and on the
//! rate-limit retry loop used around a model call elsewhere in this corpus —
//! generalized here into a provider-agnostic wrapper plus a circuit breaker,
//! since this router has no concrete HTTP provider of its own to retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use relay_model::{CompletionRequest, ModelProvider, ResponseEvent};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Default provider order, by name, when no `preferred_provider` is given.
    pub fallback_order: Vec<String>,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Outcomes tracked per circuit before the error rate is evaluated.
    pub circuit_window: usize,
    /// Error rate (0.0-1.0) over `circuit_window` that trips closed->open.
    pub circuit_error_threshold: f64,
    pub circuit_cooldown: Duration,
    /// Consecutive half-open successes needed to close the circuit again.
    pub circuit_half_open_successes: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_order: Vec::new(),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(8),
            cache_ttl: Duration::from_secs(120),
            cache_max_entries: 256,
            circuit_window: 10,
            circuit_error_threshold: 0.5,
            circuit_cooldown: Duration::from_secs(30),
            circuit_half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: CircuitState,
    outcomes: Vec<bool>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, outcomes: Vec::new(), opened_at: None, half_open_successes: 0 }
    }

    fn is_available(&mut self, cfg: &RouterConfig) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else { return true };
                if opened_at.elapsed() >= cfg.circuit_cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record(&mut self, success: bool, cfg: &RouterConfig) {
        match self.state {
            CircuitState::HalfOpen => {
                if success {
                    self.half_open_successes += 1;
                    if self.half_open_successes >= cfg.circuit_half_open_successes {
                        self.state = CircuitState::Closed;
                        self.outcomes.clear();
                    }
                } else {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                    self.half_open_successes = 0;
                }
            }
            CircuitState::Closed => {
                self.outcomes.push(success);
                if self.outcomes.len() > cfg.circuit_window {
                    self.outcomes.remove(0);
                }
                if self.outcomes.len() == cfg.circuit_window {
                    let failures = self.outcomes.iter().filter(|s| !**s).count();
                    let error_rate = failures as f64 / cfg.circuit_window as f64;
                    if error_rate >= cfg.circuit_error_threshold {
                        self.state = CircuitState::Open;
                        self.opened_at = Some(Instant::now());
                    }
                }
            }
            CircuitState::Open => {}
        }
    }
}

struct CacheEntry {
    events: Arc<Vec<ResponseEvent>>,
    expires_at: Instant,
}

enum InflightSlot {
    /// Owning caller is still driving the request; late arrivals subscribe here.
    InProgress(broadcast::Sender<Result<Arc<Vec<ResponseEvent>>, String>>),
}

/// Routes completion requests across a chain of named providers with
/// caching, in-flight request coalescing, retries, and per-provider circuit
/// breakers.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    config: RouterConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, InflightSlot>>,
    circuits: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            providers: HashMap::new(),
            config,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Current admission state of a provider's circuit. `None` if the
    /// provider has never been called (implicitly closed).
    pub async fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.circuits.lock().await.get(provider).map(|c| c.state)
    }

    fn chain_for(&self, preferred: Option<&str>) -> Vec<String> {
        if let Some(name) = preferred {
            if self.providers.contains_key(name) {
                return vec![name.to_string()];
            }
        }
        self.config
            .fallback_order
            .iter()
            .filter(|name| self.providers.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    fn cache_key(req: &CompletionRequest, preferred: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(preferred.unwrap_or("").as_bytes());
        for msg in &req.messages {
            hasher.update([0xff]);
            hasher.update(format!("{:?}", msg.role).as_bytes());
            if let Some(text) = msg.as_text() {
                hasher.update(text.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Route a completion request through the chain, applying cache, dedup,
    /// retry, and circuit-breaker policy. Returns a materialized event list
    /// rather than a live stream: caching and dedup both require the full
    /// response before they can hand it to a second caller, so the router
    /// drains each provider's stream fully before returning.
    pub async fn route(
        &self,
        req: CompletionRequest,
        preferred_provider: Option<&str>,
    ) -> anyhow::Result<Arc<Vec<ResponseEvent>>> {
        let cacheable = req.tools.is_empty();
        let key = Self::cache_key(&req, preferred_provider);

        if cacheable {
            if let Some(hit) = self.cache_lookup(&key).await {
                return Ok(hit);
            }
        }

        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(InflightSlot::InProgress(tx)) if cacheable => Some(tx.subscribe()),
                _ => {
                    if cacheable {
                        let (tx, _rx) = broadcast::channel(1);
                        inflight.insert(key.clone(), InflightSlot::InProgress(tx));
                    }
                    None
                }
            }
        };

        if let Some(rx) = rx.take() {
            return self.await_inflight(rx).await;
        }

        let result = self.call_chain(&req, preferred_provider).await;

        if cacheable {
            let mut inflight = self.inflight.lock().await;
            if let Some(InflightSlot::InProgress(tx)) = inflight.remove(&key) {
                let broadcast_result = match &result {
                    Ok(events) => Ok(events.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(broadcast_result);
            }
        }

        if let Ok(events) = &result {
            if cacheable {
                self.cache_store(key, Arc::clone(events)).await;
            }
        }

        result
    }

    async fn await_inflight(
        &self,
        mut rx: broadcast::Receiver<Result<Arc<Vec<ResponseEvent>>, String>>,
    ) -> anyhow::Result<Arc<Vec<ResponseEvent>>> {
        match rx.recv().await {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(e)) => Err(anyhow::anyhow!(e)),
            Err(_) => Err(anyhow::anyhow!("in-flight request coalescing channel closed")),
        }
    }

    async fn cache_lookup(&self, key: &str) -> Option<Arc<Vec<ResponseEvent>>> {
        let cache = self.cache.lock().await;
        cache.get(key).filter(|e| e.expires_at > Instant::now()).map(|e| Arc::clone(&e.events))
    }

    async fn cache_store(&self, key: String, events: Arc<Vec<ResponseEvent>>) {
        let mut cache = self.cache.lock().await;
        if cache.len() >= self.config.cache_max_entries && !cache.contains_key(&key) {
            if let Some(oldest_key) =
                cache.iter().min_by_key(|(_, e)| e.expires_at).map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
            }
        }
        cache.insert(key, CacheEntry { events, expires_at: Instant::now() + self.config.cache_ttl });
    }

    async fn call_chain(
        &self,
        req: &CompletionRequest,
        preferred_provider: Option<&str>,
    ) -> anyhow::Result<Arc<Vec<ResponseEvent>>> {
        let chain = self.chain_for(preferred_provider);
        if chain.is_empty() {
            anyhow::bail!("no provider available to satisfy this request");
        }

        let mut last_err: Option<anyhow::Error> = None;
        for name in &chain {
            let available = {
                let mut circuits = self.circuits.lock().await;
                circuits.entry(name.clone()).or_insert_with(CircuitBreaker::new).is_available(&self.config)
            };
            if !available {
                last_err = Some(anyhow::anyhow!("circuit open for provider '{name}'; retry later"));
                continue;
            }

            let provider = self.providers.get(name).cloned();
            let Some(provider) = provider else { continue };

            match self.call_with_retry(provider.as_ref(), req.clone()).await {
                Ok(events) => {
                    self.record_outcome(name, true).await;
                    self.record_usage(name, provider.model_name(), req, &events);
                    return Ok(Arc::new(events));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider call failed");
                    self.record_outcome(name, false).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("all providers in chain failed")))
    }

    async fn record_outcome(&self, name: &str, success: bool) {
        let mut circuits = self.circuits.lock().await;
        circuits.entry(name.to_string()).or_insert_with(CircuitBreaker::new).record(success, &self.config);
    }

    fn record_usage(&self, provider: &str, model: &str, req: &CompletionRequest, events: &[ResponseEvent]) {
        let input_chars: usize = req.messages.iter().filter_map(|m| m.as_text()).map(str::len).sum();
        let estimated_input_tokens = (input_chars / 4).max(1);
        let output_tokens = events
            .iter()
            .find_map(|e| if let ResponseEvent::Usage { output_tokens, .. } = e { Some(*output_tokens) } else { None })
            .unwrap_or(0);
        debug!(
            provider,
            model,
            estimated_input_tokens,
            output_tokens,
            "provider call usage (char/4 estimate, no cost table)"
        );
    }

    async fn call_with_retry(
        &self,
        provider: &dyn ModelProvider,
        req: CompletionRequest,
    ) -> anyhow::Result<Vec<ResponseEvent>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match provider.complete(req.clone()).await {
                Ok(stream) => match drain(stream).await {
                    Ok(events) => return Ok(events),
                    Err(e) => {
                        if attempt >= self.config.retry_max_attempts {
                            return Err(e);
                        }
                        self.backoff_sleep(attempt).await;
                    }
                },
                Err(e) => {
                    if attempt >= self.config.retry_max_attempts {
                        return Err(e);
                    }
                    self.backoff_sleep(attempt).await;
                }
            }
        }
    }

    async fn backoff_sleep(&self, attempt: u32) {
        let exp = self.config.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        let capped = exp.min(self.config.retry_max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2 + 1);
        tokio::time::sleep(capped / 2 + Duration::from_millis(jitter_ms)).await;
    }
}

async fn drain(mut stream: relay_model::ResponseStream) -> anyhow::Result<Vec<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event?);
    }
    Ok(events)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
