// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bounded registry of concurrently running subagent tasks.
//!
//! Generalizes the single blocking sub-agent call in [`crate::task_tool`]
//! into a lifecycle the `subagent` tool can drive interactively: spawn,
//! list, poll status, fetch a terminal result, cancel, remove. Bookkeeping
//! follows the registry-of-named-things shape used elsewhere in this
//! codebase — a `HashMap` behind a single mutex, listed in a stable order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// Lifecycle state of a single subagent run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

struct Entry {
    label: String,
    parent_id: Option<String>,
    status: SubagentStatus,
    result: Option<Result<String, String>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A snapshot of one run, safe to serialize for a `list` response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubagentHandle {
    pub id: String,
    pub label: String,
    pub parent_id: Option<String>,
    pub status: SubagentStatus,
}

/// Bounded pool of concurrently running subagent tasks.
///
/// `max_concurrent` counts only `Pending` + `Running` entries; terminal
/// entries (`Completed`/`Failed`/`Cancelled`) never count against the cap,
/// so a caller that doesn't `remove` finished runs won't starve new ones.
pub struct SubagentManager {
    max_concurrent: usize,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SubagentManager {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent, entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Spawn a new run. `run` is handed a cancellation receiver and must
    /// resolve that into an `Ok(final_text)` / `Err(message)` outcome itself
    /// — the manager only tracks state transitions, it has no opinion on
    /// how a run is actually driven.
    ///
    /// Returns `Err("max concurrent reached")` if the pool is saturated.
    pub async fn spawn<F, Fut>(
        &self,
        label: impl Into<String>,
        parent_id: Option<String>,
        run: F,
    ) -> Result<String, String>
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let mut entries = self.entries.lock().await;
        let in_flight = entries
            .values()
            .filter(|e| matches!(e.status, SubagentStatus::Pending | SubagentStatus::Running))
            .count();
        if in_flight >= self.max_concurrent {
            return Err("max concurrent reached".to_string());
        }

        let id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        entries.insert(
            id.clone(),
            Entry {
                label: label.into(),
                parent_id,
                status: SubagentStatus::Running,
                result: None,
                cancel_tx: Some(cancel_tx),
            },
        );
        drop(entries);

        let entries = Arc::clone(&self.entries);
        let run_id = id.clone();
        tokio::spawn(async move {
            let outcome = run(cancel_rx).await;
            let mut entries = entries.lock().await;
            if let Some(entry) = entries.get_mut(&run_id) {
                entry.cancel_tx = None;
                match outcome {
                    Ok(text) => {
                        entry.status = SubagentStatus::Completed;
                        entry.result = Some(Ok(text));
                    }
                    Err(e) if e == CANCELLED_SENTINEL => {
                        entry.status = SubagentStatus::Cancelled;
                        entry.result = Some(Err("was cancelled".to_string()));
                    }
                    Err(e) => {
                        entry.status = SubagentStatus::Failed;
                        entry.result = Some(Err(e));
                    }
                }
            }
        });

        Ok(id)
    }

    pub async fn list(&self) -> Vec<SubagentHandle> {
        let entries = self.entries.lock().await;
        let mut handles: Vec<SubagentHandle> = entries
            .iter()
            .map(|(id, e)| SubagentHandle {
                id: id.clone(),
                label: e.label.clone(),
                parent_id: e.parent_id.clone(),
                status: e.status.clone(),
            })
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub async fn status(&self, id: &str) -> Option<SubagentStatus> {
        self.entries.lock().await.get(id).map(|e| e.status.clone())
    }

    /// Fetch the terminal result. Returns a descriptive error string for
    /// non-terminal or unknown runs rather than an `Option`, matching the
    /// tool-facing contract (every path is a displayable message).
    pub async fn get_result(&self, id: &str) -> Result<String, String> {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(id) else { return Err("no such run".to_string()) };
        match entry.status {
            SubagentStatus::Pending | SubagentStatus::Running => Err("still running".to_string()),
            SubagentStatus::Cancelled => Err("was cancelled".to_string()),
            SubagentStatus::Failed => {
                Err(entry.result.clone().and_then(|r| r.err()).unwrap_or_default())
            }
            SubagentStatus::Completed => {
                Ok(entry.result.clone().and_then(|r| r.ok()).unwrap_or_default())
            }
        }
    }

    /// Signal cancellation. Returns `false` if the run is unknown or already
    /// terminal (cancellation is only meaningful for in-flight runs).
    pub async fn stop(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else { return false };
        match entry.cancel_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Remove a terminal run's bookkeeping entry. Rejects non-terminal runs.
    pub async fn remove(&self, id: &str) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(id) else { return Err("no such run".to_string()) };
        if matches!(entry.status, SubagentStatus::Pending | SubagentStatus::Running) {
            return Err("cannot remove a run that is still pending/running".to_string());
        }
        entries.remove(id);
        Ok(())
    }
}

/// Sentinel error string a `run` closure returns to signal "I observed the
/// cancellation signal and stopped", distinguishing a cancelled run from one
/// that failed on its own.
pub const CANCELLED_SENTINEL: &str = "__subagent_cancelled__";

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn spawn_then_get_result_returns_completed_text() {
        let mgr = SubagentManager::new(4);
        let id = mgr
            .spawn("task-a", None, |_cancel| async { Ok("done".to_string()) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.status(&id).await, Some(SubagentStatus::Completed));
        assert_eq!(mgr.get_result(&id).await, Ok("done".to_string()));
    }

    #[tokio::test]
    async fn get_result_on_running_run_reports_still_running() {
        let mgr = SubagentManager::new(4);
        let id = mgr
            .spawn("slow", None, |_cancel| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap();
        assert_eq!(mgr.get_result(&id).await, Err("still running".to_string()));
    }

    #[tokio::test]
    async fn failed_run_reports_stored_error() {
        let mgr = SubagentManager::new(4);
        let id = mgr
            .spawn("boom", None, |_cancel| async { Err("kaboom".to_string()) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.get_result(&id).await, Err("kaboom".to_string()));
    }

    #[tokio::test]
    async fn stop_cancels_an_in_flight_run() {
        let mgr = SubagentManager::new(4);
        let id = mgr
            .spawn("cancel-me", None, |cancel| async move {
                tokio::select! {
                    _ = cancel => Err(CANCELLED_SENTINEL.to_string()),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok("too slow".to_string()),
                }
            })
            .await
            .unwrap();

        assert!(mgr.stop(&id).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.status(&id).await, Some(SubagentStatus::Cancelled));
        assert_eq!(mgr.get_result(&id).await, Err("was cancelled".to_string()));
    }

    #[tokio::test]
    async fn spawn_rejects_once_pool_is_saturated() {
        let mgr = SubagentManager::new(1);
        let _first = mgr
            .spawn("first", None, |_cancel| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("x".to_string())
            })
            .await
            .unwrap();

        let second = mgr.spawn("second", None, |_cancel| async { Ok("y".to_string()) }).await;
        assert_eq!(second, Err("max concurrent reached".to_string()));
    }

    #[tokio::test]
    async fn remove_rejects_non_terminal_run() {
        let mgr = SubagentManager::new(4);
        let id = mgr
            .spawn("slow", None, |_cancel| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok("x".to_string())
            })
            .await
            .unwrap();
        assert!(mgr.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn remove_succeeds_after_completion() {
        let mgr = SubagentManager::new(4);
        let id = mgr.spawn("quick", None, |_cancel| async { Ok("x".to_string()) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.remove(&id).await.is_ok());
        assert_eq!(mgr.status(&id).await, None);
    }

    #[tokio::test]
    async fn list_reports_label_and_parent() {
        let mgr = SubagentManager::new(4);
        mgr.spawn("child", Some("parent-1".to_string()), |_c| async { Ok("x".to_string()) })
            .await
            .unwrap();
        let listed = mgr.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "child");
        assert_eq!(listed[0].parent_id.as_deref(), Some("parent-1"));
    }
}
