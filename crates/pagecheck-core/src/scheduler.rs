//! Per-tab finalize deadlines.
//!
//! `schedule_finalize` re-arms a one-shot timer for a tab, replacing any
//! earlier one, so a burst of DOM milestones coalesces into a single firing.
//! A firing delivers a [`Firing`] on the channel returned by
//! [`RunScheduler::new`]; the consumer must [`accept`](RunScheduler::accept)
//! it before starting a run.
//!
//! Every arm gets a fresh generation. A timer that wakes up after it was
//! replaced or cleared finds a different generation (or none) in the table
//! and delivers nothing. A firing that was delivered but not yet accepted is
//! still owned by the table: clearing or re-arming the tab makes it stale,
//! so a navigation that lands while a firing sits in the channel cancels it
//! just like an armed timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::model::TabId;

/// A delivered deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firing {
    pub tab: TabId,
    pub generation: u64,
}

#[derive(Debug)]
struct Deadline {
    generation: u64,
    /// `None` once the timer has fired and the firing awaits acceptance.
    timer: Option<JoinHandle<()>>,
}

/// Debounce timers keyed by tab.
#[derive(Debug)]
pub struct RunScheduler {
    deadlines: Mutex<HashMap<TabId, Deadline>>,
    next_generation: AtomicU64,
    fire_tx: mpsc::UnboundedSender<Firing>,
}

impl RunScheduler {
    /// Create a scheduler and the receiver its firings are delivered on.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Firing>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            deadlines: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            fire_tx,
        });
        (scheduler, fire_rx)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<TabId, Deadline>> {
        match self.deadlines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arm (or re-arm) the tab's deadline at `now + delay`.
    ///
    /// Re-arming also invalidates a firing that was delivered but not yet
    /// accepted.
    pub fn schedule_finalize(self: &Arc<Self>, tab: TabId, delay: Duration) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);

        // Hold the table lock while spawning so the timer cannot fire before
        // it is registered.
        let mut deadlines = self.table();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = weak.upgrade() {
                scheduler.fire(tab, generation);
            }
        });
        let previous = deadlines.insert(
            tab,
            Deadline {
                generation,
                timer: Some(handle),
            },
        );
        if let Some(timer) = previous.and_then(|d| d.timer) {
            timer.abort();
            trace!(tab_id = %tab, "Replaced finalize deadline");
        }
        trace!(tab_id = %tab, delay_ms = delay.as_millis() as u64, generation, "Armed finalize deadline");
    }

    /// Cancel the tab's deadline, whether still armed or already fired and
    /// waiting to be accepted. Returns whether there was one.
    pub fn clear_finalize(&self, tab: TabId) -> bool {
        let Some(deadline) = self.table().remove(&tab) else {
            return false;
        };
        match deadline.timer {
            Some(timer) => {
                timer.abort();
                debug!(tab_id = %tab, "Cleared finalize deadline");
            }
            None => debug!(
                tab_id = %tab,
                generation = deadline.generation,
                "Invalidated delivered firing"
            ),
        }
        true
    }

    /// Claim a delivered firing. Returns `false` when the tab was cleared or
    /// re-armed after the firing was sent.
    pub fn accept(&self, firing: Firing) -> bool {
        let mut deadlines = self.table();
        match deadlines.get(&firing.tab) {
            Some(deadline) if deadline.generation == firing.generation && deadline.timer.is_none() => {
                deadlines.remove(&firing.tab);
                true
            }
            _ => {
                trace!(tab_id = %firing.tab, generation = firing.generation, "Stale firing ignored");
                false
            }
        }
    }

    /// Whether a timer is armed for the tab.
    #[must_use]
    pub fn is_scheduled(&self, tab: TabId) -> bool {
        self.table().get(&tab).is_some_and(|d| d.timer.is_some())
    }

    /// Number of armed timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table().values().filter(|d| d.timer.is_some()).count()
    }

    /// Cancel every deadline and every unaccepted firing.
    pub fn clear_all(&self) {
        let drained: Vec<Deadline> = self.table().drain().map(|(_, d)| d).collect();
        for timer in drained.into_iter().filter_map(|d| d.timer) {
            timer.abort();
        }
    }

    fn fire(&self, tab: TabId, generation: u64) {
        let current = {
            let mut deadlines = self.table();
            match deadlines.get_mut(&tab) {
                Some(deadline) if deadline.generation == generation && deadline.timer.is_some() => {
                    // Dropping our own handle detaches; it does not abort.
                    deadline.timer = None;
                    true
                }
                _ => false,
            }
        };
        if !current {
            trace!(tab_id = %tab, generation, "Stale finalize deadline ignored");
            return;
        }
        debug!(tab_id = %tab, generation, "Finalize deadline fired");
        if self.fire_tx.send(Firing { tab, generation }).is_err() {
            debug!(tab_id = %tab, "Finalize receiver gone; firing dropped");
        }
    }
}
