//! Per-tab check sessions.
//!
//! A session is the execution scope of one run. At most one is active per
//! tab; starting a new one aborts its predecessor. Aborting fires the
//! session's cancellation handle so in-flight work stops being awaited and
//! its streamed results are recognised as stale.
//!
//! Terminal sessions are removed from the active table and a read-only
//! [`SessionSnapshot`] is persisted under `session:<tab>` for observers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::error::StoreError;
use crate::model::{RunId, RunStatus, TabId, now_ms};
use crate::store::{KvStore, load_json, save_json};

/// Reason recorded when a new session replaces a running one.
pub const SUPERSEDED: &str = "superseded";

fn session_key(tab: TabId) -> String {
    format!("session:{tab}")
}

#[derive(Debug)]
struct SessionRecord {
    run_id: RunId,
    started_at_ms: u64,
    handle: CancelHandle,
}

/// Persisted view of a finished or aborted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tab_id: TabId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tracks the active session of every tab.
pub struct SessionTracker {
    active: Mutex<HashMap<TabId, SessionRecord>>,
    kv: Arc<dyn KvStore>,
}

impl SessionTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            kv,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<TabId, SessionRecord>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a running session for `run_id`, aborting any session the tab
    /// already has. Returns the signal the run's work should observe.
    pub async fn start_session(&self, tab: TabId, run_id: RunId) -> CancelSignal {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let record = SessionRecord {
            run_id: run_id.clone(),
            started_at_ms: now_ms(),
            handle,
        };
        let previous = self.table().insert(tab, record);

        if let Some(previous) = previous {
            previous.handle.cancel(SUPERSEDED);
            info!(
                tab_id = %tab,
                run_id = %previous.run_id,
                next_run_id = %run_id,
                "Superseded running session"
            );
            self.persist(SessionSnapshot {
                tab_id: tab,
                run_id: previous.run_id,
                status: RunStatus::Aborted,
                started_at_ms: previous.started_at_ms,
                ended_at_ms: Some(now_ms()),
                reason: Some(SUPERSEDED.to_string()),
            })
            .await;
        }
        debug!(tab_id = %tab, run_id = %run_id, "Session started");
        signal
    }

    /// Abort the tab's active session, if any. Returns the aborted run id.
    pub async fn abort_session(&self, tab: TabId, reason: &str) -> Option<RunId> {
        let record = self.table().remove(&tab)?;
        record.handle.cancel(reason);
        info!(tab_id = %tab, run_id = %record.run_id, reason, "Session aborted");
        self.persist(SessionSnapshot {
            tab_id: tab,
            run_id: record.run_id.clone(),
            status: RunStatus::Aborted,
            started_at_ms: record.started_at_ms,
            ended_at_ms: Some(now_ms()),
            reason: Some(reason.to_string()),
        })
        .await;
        Some(record.run_id)
    }

    /// Record a terminal status for `run_id`. Ignored when the tab's active
    /// session belongs to a different run.
    pub async fn finish_session(&self, tab: TabId, run_id: &RunId, status: RunStatus) -> bool {
        let record = {
            let mut table = self.table();
            match table.get(&tab) {
                Some(record) if &record.run_id == run_id => table.remove(&tab),
                _ => None,
            }
        };
        let Some(record) = record else {
            debug!(tab_id = %tab, run_id = %run_id, "Finish for inactive session ignored");
            return false;
        };
        debug!(tab_id = %tab, run_id = %run_id, ?status, "Session finished");
        self.persist(SessionSnapshot {
            tab_id: tab,
            run_id: record.run_id,
            status,
            started_at_ms: record.started_at_ms,
            ended_at_ms: Some(now_ms()),
            reason: None,
        })
        .await;
        true
    }

    /// Whether the tab has a running session, optionally for a specific run.
    #[must_use]
    pub fn is_session_active(&self, tab: TabId, run_id: Option<&RunId>) -> bool {
        match (self.table().get(&tab), run_id) {
            (Some(record), Some(run_id)) => &record.run_id == run_id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Run id of the tab's running session.
    #[must_use]
    pub fn active_run(&self, tab: TabId) -> Option<RunId> {
        self.table().get(&tab).map(|record| record.run_id.clone())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.table().len()
    }

    /// Last persisted snapshot for the tab.
    pub async fn snapshot(&self, tab: TabId) -> Result<Option<SessionSnapshot>, StoreError> {
        load_json(self.kv.as_ref(), &session_key(tab)).await
    }

    async fn persist(&self, snapshot: SessionSnapshot) {
        let tab = snapshot.tab_id;
        if let Err(err) = save_json(self.kv.as_ref(), &session_key(tab), &snapshot).await {
            warn!(tab_id = %tab, error = %err, "Failed to persist session snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> SessionTracker {
        SessionTracker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn start_then_finish() {
        let sessions = tracker();
        let tab = TabId(1);
        let run = RunId::from("run-a");
        let signal = sessions.start_session(tab, run.clone()).await;
        assert!(sessions.is_session_active(tab, Some(&run)));
        assert!(sessions.is_session_active(tab, None));

        assert!(sessions.finish_session(tab, &run, RunStatus::Completed).await);
        assert!(!sessions.is_session_active(tab, None));
        assert!(!signal.is_cancelled());

        let snap = sessions.snapshot(tab).await.unwrap().unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.run_id, run);
        assert!(snap.ended_at_ms.is_some());
    }

    #[tokio::test]
    async fn abort_fires_signal_with_reason() {
        let sessions = tracker();
        let tab = TabId(2);
        let signal = sessions.start_session(tab, RunId::from("run-a")).await;

        let aborted = sessions.abort_session(tab, "navigation").await;
        assert_eq!(aborted, Some(RunId::from("run-a")));
        assert_eq!(signal.cancelled().await, "navigation");
        assert_eq!(sessions.active_count(), 0);

        let snap = sessions.snapshot(tab).await.unwrap().unwrap();
        assert_eq!(snap.status, RunStatus::Aborted);
        assert_eq!(snap.reason.as_deref(), Some("navigation"));
    }

    #[tokio::test]
    async fn abort_without_session_is_noop() {
        assert!(tracker().abort_session(TabId(3), "navigation").await.is_none());
    }

    #[tokio::test]
    async fn new_session_supersedes_previous() {
        let sessions = tracker();
        let tab = TabId(4);
        let first = sessions.start_session(tab, RunId::from("run-a")).await;
        let second = sessions.start_session(tab, RunId::from("run-b")).await;

        assert_eq!(first.reason().as_deref(), Some(SUPERSEDED));
        assert!(!second.is_cancelled());
        assert_eq!(sessions.active_count(), 1);
        assert!(sessions.is_session_active(tab, Some(&RunId::from("run-b"))));
        assert!(!sessions.is_session_active(tab, Some(&RunId::from("run-a"))));
    }

    #[tokio::test]
    async fn finish_with_mismatched_run_is_ignored() {
        let sessions = tracker();
        let tab = TabId(5);
        sessions.start_session(tab, RunId::from("run-b")).await;
        assert!(
            !sessions
                .finish_session(tab, &RunId::from("run-a"), RunStatus::Completed)
                .await
        );
        assert_eq!(sessions.active_run(tab), Some(RunId::from("run-b")));
    }
}
