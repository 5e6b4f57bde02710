// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! `ControlService` owns every agent session the gateway is tracking and is
//! the single place that drives [`relay_core::Agent`] turns. HTTP handlers
//! and the WebSocket bridge never touch an `Agent` directly — they go
//! through an [`AgentHandle`], which is cheap to clone and safe to hand to
//! any number of axum extractors.
//!
//! # Concurrency model
//!
//! One `ControlService` runs as a background task (spawned once at
//! startup) and owns all [`ManagedSession`]s. A submitted turn is executed
//! on its own `tokio::spawn`, with the session's `Agent` behind an
//! `Arc<Mutex<_>>` so a `Cancel` command can be processed by the service
//! loop while the turn is still streaming. Turn completion is reported back
//! to the service loop over an internal channel rather than by giving the
//! spawned task a handle into `self` — `ControlService` is never shared.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::warn;

use relay_core::{Agent, ProviderRouter, SessionStore};
use relay_model::Role;

use super::protocol::{ControlCommand, ControlEvent, SessionInfo, SessionState};

/// Builds a fresh [`Agent`] for a newly-seen session id, rooted at the given
/// working directory.
///
/// The gateway ships no concrete provider adapters, so whatever embeds
/// `relay-gateway` supplies this factory with its own `ModelProvider`,
/// `ToolRegistry`, and `AgentConfig` already wired up.
pub type AgentFactory = Arc<dyn Fn(&str) -> anyhow::Result<Agent> + Send + Sync>;

struct ManagedSession {
    agent: Arc<Mutex<Agent>>,
    state: SessionState,
    turn_count: usize,
    cancel_tx: Option<oneshot::Sender<()>>,
    working_dir: String,
    client_id: Option<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

enum Internal {
    TurnFinished {
        session_id: String,
        result: anyhow::Result<()>,
    },
}

/// Cloneable front for [`ControlService`]. Command submission is
/// fire-and-forget from the caller's perspective — results surface as
/// `ControlEvent`s on the broadcast channel, not as a return value.
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::Sender<ControlCommand>,
    events_tx: broadcast::Sender<ControlEvent>,
}

impl AgentHandle {
    /// Subscribe to the event stream. Each subscriber gets every event from
    /// the point of subscription onward; a lagging subscriber sees
    /// `RecvError::Lagged` rather than silently missing events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events_tx.subscribe()
    }

    /// Forward a command to the service. Returns an error only if the
    /// service task has already shut down.
    pub async fn send(&self, cmd: ControlCommand) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("control service is no longer running"))
    }
}

/// Owns session state and drives agent turns. Spawn [`ControlService::run`]
/// once at startup; interact with it via the paired [`AgentHandle`].
pub struct ControlService {
    factory: AgentFactory,
    /// Shared across every session's `Agent` so completions route through
    /// one cache/circuit-breaker state per provider rather than one per
    /// session. `None` when the embedding application supplied no router.
    router: Option<Arc<ProviderRouter>>,
    /// Durable session metadata + message history. When present, a session
    /// first seen this process is loaded from here before falling back to a
    /// brand-new `Agent`, and its history is saved back after every turn —
    /// sessions survive a gateway restart. `None` keeps the prior in-memory
    /// only behavior.
    store: Option<Arc<SessionStore>>,
    sessions: HashMap<String, ManagedSession>,
    events_tx: broadcast::Sender<ControlEvent>,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
}

impl ControlService {
    pub fn new(
        factory: AgentFactory,
        router: Option<Arc<ProviderRouter>>,
        store: Option<Arc<SessionStore>>,
    ) -> (Self, AgentHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(256);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let handle = AgentHandle {
            cmd_tx,
            events_tx: events_tx.clone(),
        };

        (
            Self {
                factory,
                router,
                store,
                sessions: HashMap::new(),
                events_tx,
                cmd_rx,
                internal_tx,
                internal_rx,
            },
            handle,
        )
    }

    /// Drive the service until every `AgentHandle` has been dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(ev) = self.internal_rx.recv() => {
                    self.handle_internal(ev);
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Submit { session_id, text, working_dir, preferred_provider, client_id } => {
                self.handle_submit(session_id, text, working_dir, preferred_provider, client_id).await
            }
            ControlCommand::Cancel { session_id } => self.handle_cancel(&session_id),
            ControlCommand::ListSessions => self.handle_list_sessions(),
            ControlCommand::Background { session_id } => self.handle_background(&session_id),
            ControlCommand::Activate { session_id, client_id } => {
                self.handle_activate(&session_id, client_id)
            }
            ControlCommand::DeleteSession { session_id } => self.handle_delete(&session_id),
        }
    }

    async fn handle_submit(
        &mut self,
        session_id: String,
        text: String,
        working_dir: Option<String>,
        preferred_provider: Option<String>,
        client_id: Option<String>,
    ) {
        let working_dir = working_dir.unwrap_or_else(|| ".".to_string());
        let session = match self.get_or_create(&session_id, &working_dir).await {
            Ok(s) => s,
            Err(e) => {
                self.emit_error(503, format!("failed to start session: {e}"));
                return;
            }
        };

        if session.state == SessionState::Running {
            self.emit_error(409, format!("session {session_id} already has a turn in flight"));
            return;
        }

        if client_id.is_some() {
            session.client_id = client_id;
        }
        session.updated_at = Utc::now();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        session.cancel_tx = Some(cancel_tx);
        session.state = SessionState::Running;

        let agent = Arc::clone(&session.agent);
        if preferred_provider.is_some() {
            agent.lock().await.set_preferred_provider(preferred_provider);
        }
        let events_tx = self.events_tx.clone();
        let internal_tx = self.internal_tx.clone();
        let store = self.store.clone();
        let sid = session_id.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel(128);
            let fwd_sid = sid.clone();
            let fwd_events_tx = events_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let wire = ControlEvent::Agent {
                        session_id: fwd_sid.clone(),
                        event: (&ev).into(),
                    };
                    let _ = fwd_events_tx.send(wire);
                }
            });

            let result = {
                let mut agent = agent.lock().await;
                let result = agent.submit_with_cancel(&text, tx, cancel_rx).await;
                if let Some(store) = &store {
                    if let Err(e) = store.save(&sid, &agent.session().messages) {
                        warn!(session_id = %sid, error = %e, "failed to persist session history");
                    }
                }
                result
            };
            let _ = forwarder.await;

            let _ = internal_tx
                .send(Internal::TurnFinished { session_id: sid, result })
                .await;
        });
    }

    fn handle_cancel(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            if let Some(tx) = session.cancel_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn handle_list_sessions(&mut self) {
        let sessions = self.sessions.iter().map(|(id, s)| session_info(id, s)).collect();
        let _ = self.events_tx.send(ControlEvent::SessionList { sessions });
    }

    fn handle_background(&mut self, session_id: &str) {
        match self.sessions.get_mut(session_id) {
            Some(session) if session.state != SessionState::Running => {
                session.state = SessionState::Background;
                session.updated_at = Utc::now();
                if let Some(store) = &self.store {
                    if let Err(e) = store.background(session_id) {
                        warn!(session_id, error = %e, "failed to persist session state");
                    }
                }
            }
            Some(_) => self.emit_error(409, format!("session {session_id} has a turn in flight")),
            None => self.emit_error(404, format!("no such session: {session_id}")),
        }
    }

    fn handle_activate(&mut self, session_id: &str, client_id: Option<String>) {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.state = SessionState::Idle;
                if client_id.is_some() {
                    session.client_id = client_id.clone();
                }
                session.updated_at = Utc::now();
                if let Some(store) = &self.store {
                    let client = client_id.or_else(|| session.client_id.clone()).unwrap_or_default();
                    if let Err(e) = store.activate(session_id, &client) {
                        warn!(session_id, error = %e, "failed to persist session state");
                    }
                }
            }
            None => self.emit_error(404, format!("no such session: {session_id}")),
        }
    }

    fn handle_delete(&mut self, session_id: &str) {
        if self.sessions.remove(session_id).is_none() {
            self.emit_error(404, format!("no such session: {session_id}"));
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(session_id) {
                warn!(session_id, error = %e, "failed to delete session from store");
            }
        }
    }

    fn handle_internal(&mut self, ev: Internal) {
        match ev {
            Internal::TurnFinished { session_id, result } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.cancel_tx = None;
                    session.turn_count += 1;
                    session.updated_at = Utc::now();
                    session.state = match result {
                        Ok(()) => SessionState::Idle,
                        Err(ref e) => {
                            warn!(session_id, error = %e, "agent turn failed");
                            SessionState::Errored
                        }
                    };
                }
                if let Err(e) = result {
                    self.emit_error(500, format!("turn failed: {e}"));
                }
            }
        }
    }

    /// Look up a tracked session, loading it from `self.store` on first
    /// sight this process, or falling back to a brand new one.
    async fn get_or_create(
        &mut self,
        session_id: &str,
        working_dir: &str,
    ) -> anyhow::Result<&mut ManagedSession> {
        if !self.sessions.contains_key(session_id) {
            let mut agent = (self.factory)(working_dir)?;
            if let Some(router) = &self.router {
                agent = agent.with_router(Arc::clone(router));
            }

            let managed = if let Some(store) = &self.store {
                match store.load(session_id) {
                    Ok(Some((record, messages))) => {
                        agent.seed_history(messages).await;
                        ManagedSession {
                            agent: Arc::new(Mutex::new(agent)),
                            state: SessionState::Idle,
                            turn_count: record.message_count,
                            cancel_tx: None,
                            working_dir: record.working_dir.unwrap_or_else(|| working_dir.to_string()),
                            client_id: record.active_client,
                            created_at: record.created_at,
                            updated_at: record.updated_at,
                        }
                    }
                    Ok(None) => {
                        if let Err(e) = store.create(session_id, Some(working_dir)) {
                            warn!(session_id, error = %e, "failed to persist new session");
                        }
                        let now = Utc::now();
                        ManagedSession {
                            agent: Arc::new(Mutex::new(agent)),
                            state: SessionState::Idle,
                            turn_count: 0,
                            cancel_tx: None,
                            working_dir: working_dir.to_string(),
                            client_id: None,
                            created_at: now,
                            updated_at: now,
                        }
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "failed to load session from store");
                        let now = Utc::now();
                        ManagedSession {
                            agent: Arc::new(Mutex::new(agent)),
                            state: SessionState::Idle,
                            turn_count: 0,
                            cancel_tx: None,
                            working_dir: working_dir.to_string(),
                            client_id: None,
                            created_at: now,
                            updated_at: now,
                        }
                    }
                }
            } else {
                let now = Utc::now();
                ManagedSession {
                    agent: Arc::new(Mutex::new(agent)),
                    state: SessionState::Idle,
                    turn_count: 0,
                    cancel_tx: None,
                    working_dir: working_dir.to_string(),
                    client_id: None,
                    created_at: now,
                    updated_at: now,
                }
            };

            self.sessions.insert(session_id.to_string(), managed);
        }
        Ok(self.sessions.get_mut(session_id).expect("just inserted"))
    }

    fn emit_error(&self, code: u32, message: String) {
        let _ = self.events_tx.send(ControlEvent::GatewayError { code, message });
    }
}

/// Snapshot a [`ManagedSession`] into its wire representation.
///
/// Uses `try_lock` rather than `.await` — the event loop must not block on a
/// turn that's mid-stream just to answer a list request. A locked session
/// reports its last-known counts.
fn session_info(id: &str, s: &ManagedSession) -> SessionInfo {
    let (token_count, max_tokens, message_counts) = match s.agent.try_lock() {
        Ok(agent) => {
            let session = agent.session();
            let mut counts = std::collections::BTreeMap::new();
            for m in &session.messages {
                let key = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                *counts.entry(key.to_string()).or_insert(0) += 1;
            }
            (session.token_count, session.max_tokens, counts)
        }
        Err(_) => (0, 0, std::collections::BTreeMap::new()),
    };

    SessionInfo {
        id: id.to_string(),
        state: s.state,
        turn_count: s.turn_count,
        token_count,
        max_tokens,
        working_dir: s.working_dir.clone(),
        client_id: s.client_id.clone(),
        created_at: s.created_at,
        updated_at: s.updated_at,
        message_counts,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, Mutex};

    use relay_config::AgentConfig;
    use relay_model::MockProvider;
    use relay_tools::ToolRegistry;

    use super::*;

    fn test_factory() -> AgentFactory {
        Arc::new(|_working_dir: &str| {
            let (_tx, rx) = mpsc::channel(8);
            Ok(Agent::new(
                Arc::new(MockProvider),
                Arc::new(ToolRegistry::new()),
                Arc::new(AgentConfig::default()),
                Default::default(),
                Arc::new(Mutex::new(relay_config::AgentMode::Agent)),
                rx,
                8_000,
            ))
        })
    }

    async fn recv_within(
        rx: &mut broadcast::Receiver<ControlEvent>,
        timeout: Duration,
    ) -> Option<ControlEvent> {
        tokio::time::timeout(timeout, rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn submit_creates_session_and_completes_turn() {
        let (service, handle) = ControlService::new(test_factory(), None, None);
        tokio::spawn(service.run());

        let mut events = handle.subscribe();
        handle
            .send(ControlCommand::Submit { session_id: "s1".into(), text: "hi".into(), working_dir: None, preferred_provider: None, client_id: None })
            .await
            .unwrap();

        let mut saw_turn_complete = false;
        for _ in 0..20 {
            match recv_within(&mut events, Duration::from_secs(2)).await {
                Some(ControlEvent::Agent { session_id, event }) => {
                    assert_eq!(session_id, "s1");
                    if matches!(event, super::super::protocol::SerializableAgentEvent::TurnComplete) {
                        saw_turn_complete = true;
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(saw_turn_complete);
    }

    #[tokio::test]
    async fn list_sessions_reports_known_sessions() {
        let (service, handle) = ControlService::new(test_factory(), None, None);
        tokio::spawn(service.run());

        handle
            .send(ControlCommand::Submit { session_id: "s1".into(), text: "hi".into(), working_dir: None, preferred_provider: None, client_id: None })
            .await
            .unwrap();

        // Give the submit a moment to register the session before listing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut events = handle.subscribe();
        handle.send(ControlCommand::ListSessions).await.unwrap();

        let mut found = false;
        for _ in 0..20 {
            if let Some(ControlEvent::SessionList { sessions }) =
                recv_within(&mut events, Duration::from_secs(2)).await
            {
                found = sessions.iter().any(|s| s.id == "s1");
                break;
            }
        }
        assert!(found);
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_a_no_op() {
        let (service, handle) = ControlService::new(test_factory(), None, None);
        tokio::spawn(service.run());
        handle
            .send(ControlCommand::Cancel { session_id: "does-not-exist".into() })
            .await
            .unwrap();
        // No panic, no error event expected for a session that never started.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn submitting_twice_while_running_emits_conflict() {
        let (service, handle) = ControlService::new(test_factory(), None, None);
        tokio::spawn(service.run());

        let mut events = handle.subscribe();
        handle
            .send(ControlCommand::Submit { session_id: "s1".into(), text: "hi".into(), working_dir: None, preferred_provider: None, client_id: None })
            .await
            .unwrap();
        handle
            .send(ControlCommand::Submit { session_id: "s1".into(), text: "again".into(), working_dir: None, preferred_provider: None, client_id: None })
            .await
            .unwrap();

        let mut saw_conflict = false;
        for _ in 0..20 {
            if let Some(ControlEvent::GatewayError { code, .. }) =
                recv_within(&mut events, Duration::from_secs(2)).await
            {
                if code == 409 {
                    saw_conflict = true;
                    break;
                }
            }
        }
        assert!(saw_conflict);
    }
}
