//! Bounded per-tab history of run lifecycle records.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::model::{RunId, RunState, RunStatus, TabId, TriggerReason, now_ms};
use crate::store::{KvStore, load_json, save_json};

fn state_key(tab: TabId) -> String {
    format!("runstate:{tab}")
}

/// Persists `RunState` records under `runstate:<tab>`, newest last.
pub struct RunStateTracker {
    kv: Arc<dyn KvStore>,
    limit: usize,
    lock: Mutex<()>,
}

impl RunStateTracker {
    pub fn new(kv: Arc<dyn KvStore>, limit: usize) -> Self {
        Self {
            kv,
            limit: limit.max(1),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self, tab: TabId) -> Result<Vec<RunState>> {
        Ok(load_json(self.kv.as_ref(), &state_key(tab))
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, tab: TabId, history: &[RunState]) -> Result<()> {
        Ok(save_json(self.kv.as_ref(), &state_key(tab), &history).await?)
    }

    /// Record a run entering `running`.
    pub async fn begin(
        &self,
        tab: TabId,
        run_id: RunId,
        url: impl Into<String>,
        trigger: Option<TriggerReason>,
    ) -> Result<RunState> {
        let state = RunState {
            run_id,
            tab_id: tab,
            url: url.into(),
            trigger,
            status: RunStatus::Running,
            started_at_ms: now_ms(),
            ended_at_ms: None,
            result_count: 0,
            reason: None,
        };
        let _guard = self.lock.lock().await;
        let mut history = self.load(tab).await?;
        history.push(state.clone());
        if history.len() > self.limit {
            let excess = history.len() - self.limit;
            history.drain(..excess);
        }
        self.save(tab, &history).await?;
        trace!(tab_id = %tab, run_id = %state.run_id, "Run state begun");
        Ok(state)
    }

    /// Move a recorded run to `status`. Terminal statuses stamp the end time.
    /// Returns `None` if the run has already fallen out of the history.
    pub async fn update(
        &self,
        tab: TabId,
        run_id: &RunId,
        status: RunStatus,
        result_count: usize,
        reason: Option<String>,
    ) -> Result<Option<RunState>> {
        let _guard = self.lock.lock().await;
        let mut history = self.load(tab).await?;
        let Some(state) = history.iter_mut().rev().find(|s| &s.run_id == run_id) else {
            return Ok(None);
        };
        state.status = status;
        state.result_count = result_count;
        state.reason = reason;
        if status.is_terminal() {
            state.ended_at_ms = Some(now_ms());
        }
        let updated = state.clone();
        self.save(tab, &history).await?;
        trace!(tab_id = %tab, run_id = %run_id, ?status, "Run state updated");
        Ok(Some(updated))
    }

    pub async fn latest(&self, tab: TabId) -> Result<Option<RunState>> {
        let _guard = self.lock.lock().await;
        Ok(self.load(tab).await?.pop())
    }

    /// Oldest first.
    pub async fn history(&self, tab: TabId) -> Result<Vec<RunState>> {
        let _guard = self.lock.lock().await;
        self.load(tab).await
    }
}
