//! Durable, deduplicating result store.
//!
//! Result lists are stored per `(tab, key)` under `results:<tab>:<key>`.
//! Every write is a read-merge-write serialized by a per-key FIFO mutex, so
//! concurrent chunk emits for the same list never interleave.
//!
//! Merging replaces `pending` placeholders with the real results of the same
//! rule and collapses duplicates by `(rule id, run id)`. When the backend
//! rejects a write for size, the store walks a degradation ladder instead of
//! failing the run: first pending placeholders are stripped from the
//! incoming batch, then only the most recent window of it is kept. If even
//! that does not fit the write is dropped and reported.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::model::{CheckResult, RunId, TabId};
use crate::session::SessionTracker;
use crate::store::{KvStore, load_json, save_json};

/// Key of the list a pipeline writes run results to.
pub const RESULTS_KEY: &str = "results";

const MIN_DEGRADE_WINDOW: usize = 10;
const MAX_DEGRADE_WINDOW: usize = 100;
const CHANGE_CHANNEL_CAPACITY: usize = 256;

fn storage_key(tab: TabId, key: &str) -> String {
    format!("results:{tab}:{key}")
}

// =============================================================================
// Pure merge operations
// =============================================================================

/// Merge `incoming` into `previous`.
///
/// Pending entries in `previous` whose rule id or name appears in `incoming`
/// are dropped. The remaining entries are deduplicated by `(rule id, run id)`
/// with the later value winning at the earlier position, except that a
/// runner failure entry keeps its first occurrence.
#[must_use]
pub fn merge_results(previous: &[CheckResult], incoming: &[CheckResult]) -> Vec<CheckResult> {
    let mut replaced: HashSet<&str> = HashSet::new();
    for result in incoming {
        if let Some(rule_id) = result.rule_id.as_deref() {
            replaced.insert(rule_id);
        }
        replaced.insert(result.name.as_str());
    }

    let kept = previous.iter().filter(|result| {
        !(result.is_pending()
            && (replaced.contains(result.name.as_str())
                || result
                    .rule_id
                    .as_deref()
                    .is_some_and(|id| replaced.contains(id))))
    });

    let mut merged: Vec<CheckResult> = Vec::with_capacity(previous.len() + incoming.len());
    let mut positions: HashMap<(String, Option<RunId>), usize> = HashMap::new();
    for result in kept.chain(incoming.iter()) {
        let key = (result.identity().to_string(), result.run_id.clone());
        match positions.get(&key) {
            Some(&idx) => {
                if !(merged[idx].is_runner_error() && result.is_runner_error()) {
                    merged[idx] = result.clone();
                }
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(result.clone());
            }
        }
    }
    merged
}

/// Keep only entries of the `keep` most recent run ids.
///
/// A run's recency is the position of its last entry; entries without a run
/// id are discarded.
#[must_use]
pub fn retain_recent_runs(list: &[CheckResult], keep: usize) -> Vec<CheckResult> {
    let mut last_seen: HashMap<&RunId, usize> = HashMap::new();
    for (idx, result) in list.iter().enumerate() {
        if let Some(run_id) = result.run_id.as_ref() {
            last_seen.insert(run_id, idx);
        }
    }
    let mut runs: Vec<(&RunId, usize)> = last_seen.into_iter().collect();
    runs.sort_by(|a, b| b.1.cmp(&a.1));
    let recent: HashSet<&RunId> = runs.into_iter().take(keep).map(|(id, _)| id).collect();

    list.iter()
        .filter(|result| result.run_id.as_ref().is_some_and(|id| recent.contains(id)))
        .cloned()
        .collect()
}

// =============================================================================
// Store
// =============================================================================

/// Degradation step that finally succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeStep {
    /// Pending placeholders were stripped from the incoming batch
    StrippedPending,
    /// Only the most recent window of the incoming batch was stored
    Windowed,
}

/// Outcome of a merge write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Stored { count: usize },
    Degraded { count: usize, step: DegradeStep },
    /// Nothing was written
    Dropped,
}

impl MergeOutcome {
    #[must_use]
    pub fn stored_count(&self) -> Option<usize> {
        match self {
            Self::Stored { count } | Self::Degraded { count, .. } => Some(*count),
            Self::Dropped => None,
        }
    }
}

/// Change notification published after every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsChanged {
    pub tab: TabId,
    pub key: String,
    pub count: usize,
}

/// Per-tab result lists on top of a [`KvStore`].
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    retain_runs: usize,
    degrade_window: usize,
    locks: Mutex<HashMap<(TabId, String), Arc<tokio::sync::Mutex<()>>>>,
    changes: broadcast::Sender<ResultsChanged>,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &StoreConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            kv,
            retain_runs: config.retain_runs.max(1),
            degrade_window: config
                .degrade_window
                .clamp(MIN_DEGRADE_WINDOW, MAX_DEGRADE_WINDOW),
            locks: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Receive a notification for every successful write.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ResultsChanged> {
        self.changes.subscribe()
    }

    fn key_lock(&self, tab: TabId, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry((tab, key.to_string())).or_default())
    }

    fn known_keys(&self, tab: TabId) -> Vec<String> {
        let locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .keys()
            .filter(|(t, _)| *t == tab)
            .map(|(_, key)| key.clone())
            .collect()
    }

    async fn read(&self, tab: TabId, key: &str) -> Result<Vec<CheckResult>> {
        let storage_key = storage_key(tab, key);
        match load_json(self.kv.as_ref(), &storage_key).await {
            Ok(list) => Ok(list.unwrap_or_default()),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(tab_id = %tab, key, reason = %reason, "Discarding corrupt result list");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(
        &self,
        tab: TabId,
        key: &str,
        list: &[CheckResult],
    ) -> std::result::Result<(), StoreError> {
        save_json(self.kv.as_ref(), &storage_key(tab, key), &list).await?;
        let _ = self.changes.send(ResultsChanged {
            tab,
            key: key.to_string(),
            count: list.len(),
        });
        Ok(())
    }

    /// Current list for `(tab, key)`.
    pub async fn load(&self, tab: TabId, key: &str) -> Result<Vec<CheckResult>> {
        let lock = self.key_lock(tab, key);
        let _guard = lock.lock().await;
        self.read(tab, key).await
    }

    /// Merge `incoming` into the stored list.
    pub async fn merge(
        &self,
        tab: TabId,
        key: &str,
        incoming: &[CheckResult],
    ) -> Result<MergeOutcome> {
        let lock = self.key_lock(tab, key);
        let _guard = lock.lock().await;
        self.merge_locked(tab, key, incoming).await
    }

    /// Merge only while `run_id` is still the tab's active session.
    ///
    /// Returns `None` when the batch was dropped as stale.
    pub async fn merge_if_active(
        &self,
        sessions: &SessionTracker,
        tab: TabId,
        run_id: &RunId,
        key: &str,
        incoming: &[CheckResult],
    ) -> Result<Option<MergeOutcome>> {
        let lock = self.key_lock(tab, key);
        let _guard = lock.lock().await;
        if !sessions.is_session_active(tab, Some(run_id)) {
            debug!(
                tab_id = %tab,
                run_id = %run_id,
                results = incoming.len(),
                "Dropping results of inactive session"
            );
            return Ok(None);
        }
        self.merge_locked(tab, key, incoming).await.map(Some)
    }

    async fn merge_locked(
        &self,
        tab: TabId,
        key: &str,
        incoming: &[CheckResult],
    ) -> Result<MergeOutcome> {
        let previous = self.read(tab, key).await?;

        let merged = merge_results(&previous, incoming);
        match self.write(tab, key, &merged).await {
            Ok(()) => return Ok(MergeOutcome::Stored { count: merged.len() }),
            Err(err) if err.is_quota() => {
                warn!(tab_id = %tab, key, error = %err, "Result write over quota; stripping pending");
            }
            Err(err) => return Err(err.into()),
        }

        let stripped: Vec<CheckResult> = incoming
            .iter()
            .filter(|result| !result.is_pending())
            .cloned()
            .collect();
        let merged = merge_results(&previous, &stripped);
        match self.write(tab, key, &merged).await {
            Ok(()) => {
                return Ok(MergeOutcome::Degraded {
                    count: merged.len(),
                    step: DegradeStep::StrippedPending,
                });
            }
            Err(err) if err.is_quota() => {
                warn!(
                    tab_id = %tab,
                    key,
                    window = self.degrade_window,
                    "Result write over quota; keeping recent window"
                );
            }
            Err(err) => return Err(err.into()),
        }

        let start = stripped.len().saturating_sub(self.degrade_window);
        let window = merge_results(&[], &stripped[start..]);
        match self.write(tab, key, &window).await {
            Ok(()) => Ok(MergeOutcome::Degraded {
                count: window.len(),
                step: DegradeStep::Windowed,
            }),
            Err(err) if err.is_quota() => {
                warn!(tab_id = %tab, key, error = %err, "Result write dropped");
                Ok(MergeOutcome::Dropped)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Apply the retention policy to `(tab, key)`. Returns the number of
    /// entries removed.
    pub async fn sweep(&self, tab: TabId, key: &str) -> Result<usize> {
        let lock = self.key_lock(tab, key);
        let _guard = lock.lock().await;
        let list = self.read(tab, key).await?;
        let kept = retain_recent_runs(&list, self.retain_runs);
        let removed = list.len() - kept.len();
        if removed > 0 {
            self.write(tab, key, &kept).await?;
            debug!(tab_id = %tab, key, removed, "Swept old results");
        }
        Ok(removed)
    }

    /// Drop the `pending` placeholders of one run. Returns how many were removed.
    pub async fn discard_pending(&self, tab: TabId, key: &str, run_id: &RunId) -> Result<usize> {
        let lock = self.key_lock(tab, key);
        let _guard = lock.lock().await;
        let list = self.read(tab, key).await?;
        let before = list.len();
        let kept: Vec<CheckResult> = list
            .into_iter()
            .filter(|r| !(r.is_pending() && r.run_id.as_ref() == Some(run_id)))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write(tab, key, &kept).await?;
        }
        Ok(removed)
    }

    /// Remove every result list known for the tab.
    pub async fn clear(&self, tab: TabId) -> Result<()> {
        let mut keys = self.known_keys(tab);
        if !keys.iter().any(|k| k == RESULTS_KEY) {
            keys.push(RESULTS_KEY.to_string());
        }
        for key in keys {
            let lock = self.key_lock(tab, &key);
            let _guard = lock.lock().await;
            self.kv.remove(&storage_key(tab, &key)).await?;
            let _ = self.changes.send(ResultsChanged {
                tab,
                key,
                count: 0,
            });
        }
        info!(tab_id = %tab, "Cleared stored results");
        Ok(())
    }
}
