// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable session storage backed by SQLite.
//!
//! Two tables: `sessions` (one row per session, metadata + lifecycle state)
//! and `messages` (one row per message, `unique(session_id, seq)`). Saving a
//! session is transactional: upsert the session row, then delete and
//! reinsert every message row for that session — simpler than diffing and
//! cheap enough since a session's message list is only ever appended to or
//! replaced wholesale (compaction, resubmit).
//!
//! Pragmas favor crash tolerance over raw throughput: WAL journal mode,
//! `synchronous = NORMAL`, and a 5s busy timeout so concurrent readers don't
//! immediately error out while a save is in flight.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use relay_model::Message;

/// Lifecycle state of a stored session, independent of whether it currently
/// has a live [`crate::Agent`] attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordState {
    /// Held by exactly one client, expected to keep submitting turns.
    Active,
    /// Not currently attached to any client.
    Idle,
    /// Detached and still running (e.g. a long subagent-driven task).
    Background,
}

impl SessionRecordState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Background => "background",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "background" => Self::Background,
            _ => Self::Idle,
        }
    }
}

/// Metadata row for a stored session (without its message history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub working_dir: Option<String>,
    pub message_count: usize,
    pub state: SessionRecordState,
    /// Client id that currently holds this session `active`, if any.
    pub active_client: Option<String>,
}

/// SQLite-backed session store. Safe to share via `Arc`; all access goes
/// through the internal mutex since `rusqlite::Connection` is not `Sync`.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the store at `path`. Pass `":memory:"` for tests.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening session store {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                working_dir   TEXT,
                state         TEXT NOT NULL DEFAULT 'idle',
                active_client TEXT
            );
            CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                role       TEXT NOT NULL,
                message    TEXT NOT NULL,
                UNIQUE(session_id, seq)
            );
            ",
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Create a new session row. New sessions start `active`.
    pub fn create(&self, id: &str, working_dir: Option<&str>) -> anyhow::Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, created_at, updated_at, working_dir, state)
             VALUES (?1, ?2, ?2, ?3, 'active')",
            params![id, now.to_rfc3339(), working_dir],
        )?;
        Ok(())
    }

    /// Upsert the session row and replace its message history, in one
    /// transaction.
    pub fn save(&self, id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sessions (id, created_at, updated_at, state)
             VALUES (?1, ?2, ?2, 'idle')
             ON CONFLICT(id) DO UPDATE SET updated_at = ?2",
            params![id, now],
        )?;

        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        for (seq, msg) in messages.iter().enumerate() {
            let role = format!("{:?}", msg.role).to_lowercase();
            let json = serde_json::to_string(msg)?;
            tx.execute(
                "INSERT INTO messages (session_id, seq, role, message) VALUES (?1, ?2, ?3, ?4)",
                params![id, seq as i64, role, json],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Load a session's metadata and full message history.
    pub fn load(&self, id: &str) -> anyhow::Result<Option<(SessionRecord, Vec<Message>)>> {
        let conn = self.conn.lock().unwrap();
        let Some(record) = Self::load_record(&conn, id)? else { return Ok(None) };

        let mut stmt = conn.prepare(
            "SELECT message FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let messages = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|json| serde_json::from_str(&json))
            .collect::<Result<Vec<Message>, _>>()?;

        Ok(Some((record, messages)))
    }

    fn load_record(conn: &Connection, id: &str) -> anyhow::Result<Option<SessionRecord>> {
        let record = conn
            .query_row(
                "SELECT s.id, s.created_at, s.updated_at, s.working_dir, s.state, s.active_client,
                        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
                 FROM sessions s WHERE s.id = ?1",
                params![id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        created_at: parse_ts(row.get::<_, String>(1)?),
                        updated_at: parse_ts(row.get::<_, String>(2)?),
                        working_dir: row.get(3)?,
                        state: SessionRecordState::parse(&row.get::<_, String>(4)?),
                        active_client: row.get(5)?,
                        message_count: row.get::<_, i64>(6)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn list(&self) -> anyhow::Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.created_at, s.updated_at, s.working_dir, s.state, s.active_client,
                    (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id)
             FROM sessions s ORDER BY s.updated_at DESC",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    created_at: parse_ts(row.get::<_, String>(1)?),
                    updated_at: parse_ts(row.get::<_, String>(2)?),
                    working_dir: row.get(3)?,
                    state: SessionRecordState::parse(&row.get::<_, String>(4)?),
                    active_client: row.get(5)?,
                    message_count: row.get::<_, i64>(6)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn set_state(&self, id: &str, state: SessionRecordState) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(n > 0)
    }

    /// Detach a session from any client while leaving it running.
    pub fn background(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET state = 'background', active_client = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    /// Claim a session as `active` for `client`. Fails if another client
    /// already holds it active.
    pub fn activate(&self, id: &str, client: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let current = conn
            .query_row(
                "SELECT state, active_client FROM sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        let Some((state, active_client)) = current else { return Ok(false) };
        if state == "active" {
            if active_client.as_deref() != Some(client) {
                return Ok(false);
            }
        }

        conn.execute(
            "UPDATE sessions SET state = 'active', active_client = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, client, Utc::now().to_rfc3339()],
        )?;
        Ok(true)
    }

    /// Delete sessions whose `updated_at` is older than `older_than` ago.
    /// Returns the number of sessions removed.
    pub fn clean_old(&self, older_than: chrono::Duration) -> anyhow::Result<usize> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let ids: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions WHERE updated_at < ?1")?;
            stmt.query_map(params![cutoff], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        for id in &ids {
            conn.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        }
        conn.execute("DELETE FROM sessions WHERE updated_at < ?1", params![cutoff])?;
        Ok(ids.len())
    }

    pub fn clean_all(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM sessions", [])?;
        conn.execute("DELETE FROM messages", [])?;
        Ok(n as usize)
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
