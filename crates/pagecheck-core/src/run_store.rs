//! Event collector and per-tab run store.
//!
//! Each tab has at most one accumulating [`Run`], persisted under
//! `run:<tab>`. Events are appended until the finalize handler pops the run;
//! a navigation start replaces it with an empty one. Every operation holds
//! the store lock across its read-modify-write, so `pop_run` observes and
//! clears a run atomically with respect to concurrent appends.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::model::{Event, Run, RunId, TabId};
use crate::store::{KvStore, load_json, save_json};

fn run_key(tab: TabId) -> String {
    format!("run:{tab}")
}

/// Accumulates events into per-tab runs.
pub struct RunStore {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl RunStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self, tab: TabId) -> Result<Option<Run>> {
        Ok(load_json(self.kv.as_ref(), &run_key(tab)).await?)
    }

    async fn save(&self, tab: TabId, run: &Run) -> Result<()> {
        Ok(save_json(self.kv.as_ref(), &run_key(tab), run).await?)
    }

    /// Append an event, creating the run if absent. Returns the run's id and
    /// its event count after the append.
    pub async fn add_event(&self, tab: TabId, event: Event) -> Result<(RunId, usize)> {
        let _guard = self.lock.lock().await;
        let mut run = self.load(tab).await?.unwrap_or_default();
        trace!(tab_id = %tab, run_id = %run.id, kind = %event.kind, "Appending event");
        run.events.push(event);
        self.save(tab, &run).await?;
        Ok((run.id, run.events.len()))
    }

    /// Flag the tab's run as DOM-ready, creating the run if absent.
    pub async fn set_dom_done(&self, tab: TabId) -> Result<RunId> {
        let _guard = self.lock.lock().await;
        let mut run = self.load(tab).await?.unwrap_or_default();
        run.dom_done = true;
        self.save(tab, &run).await?;
        Ok(run.id)
    }

    /// Read and clear the tab's run.
    pub async fn pop_run(&self, tab: TabId) -> Result<Option<Run>> {
        let _guard = self.lock.lock().await;
        let run = self.load(tab).await?;
        if run.is_some() {
            self.kv.remove(&run_key(tab)).await?;
        }
        Ok(run)
    }

    /// Replace the tab's run with a fresh empty one.
    pub async fn reset(&self, tab: TabId) -> Result<RunId> {
        let _guard = self.lock.lock().await;
        let run = Run::new();
        self.save(tab, &run).await?;
        Ok(run.id)
    }

    /// Copy of the tab's current run, if any.
    pub async fn peek(&self, tab: TabId) -> Result<Option<Run>> {
        let _guard = self.lock.lock().await;
        self.load(tab).await
    }
}
