//! Run lifecycle orchestration.
//!
//! The pipeline owns every component and drives a tab through
//! accumulate → debounce → guard → execute → merge:
//!
//! 1. [`Pipeline::push_event`] appends signals to the tab's run and re-arms
//!    the finalize deadline. A navigation start instead clears the deadline,
//!    resets the run, optionally clears stored results and aborts the running
//!    session, in that order.
//! 2. The finalize loop started by [`Pipeline::spawn`] consumes deadline
//!    firings and runs [`Pipeline::finalize`] for each on its own task.
//! 3. `finalize` pops the run, applies the guard, opens a session, inserts
//!    pending placeholders, executes the rules locally or through the bridge
//!    while streaming results into the store, then writes the final list,
//!    applies retention and closes the session.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, info, warn};

use crate::bridge::{BridgeClient, runner_error_result};
use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::{self, RunDecision};
use crate::merge::{RESULTS_KEY, ResultStore};
use crate::model::{
    CheckContext, CheckResult, Event, Page, PageBuilder, RunId, RunState, RunStatus, TabId,
    SnapshotPageBuilder,
};
use crate::pc_span;
use crate::queue::{ChannelSink, RuleQueue, pending_placeholders};
use crate::rules::RuleRegistry;
use crate::run_state::RunStateTracker;
use crate::run_store::RunStore;
use crate::scheduler::{Firing, RunScheduler};
use crate::session::SessionTracker;
use crate::store::KvStore;

/// Abort reason used when a navigation starts.
pub const NAVIGATION: &str = "navigation";

/// Where a run's rules execute.
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// On this runtime's rule queue
    Local,
    /// Delegated to a remote runner over the bridge
    Remote(BridgeClient),
}

/// The page-check pipeline.
pub struct Pipeline {
    config: Config,
    registry: Arc<RuleRegistry>,
    queue: RuleQueue,
    mode: ExecutionMode,
    page_builder: Arc<dyn PageBuilder>,
    runs: RunStore,
    scheduler: Arc<RunScheduler>,
    /// Firing receiver, taken by the finalize loop.
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<Firing>>>,
    sessions: Arc<SessionTracker>,
    results: Arc<ResultStore>,
    run_states: RunStateTracker,
}

impl Pipeline {
    /// Build a pipeline persisting runs, sessions, run states and results
    /// into `kv`. Nothing runs until [`Pipeline::spawn`].
    pub fn new(
        config: Config,
        registry: RuleRegistry,
        kv: Arc<dyn KvStore>,
        mode: ExecutionMode,
    ) -> Self {
        let (scheduler, fire_rx) = RunScheduler::new();
        Self {
            queue: RuleQueue::new(config.queue.clone()),
            registry: Arc::new(registry),
            mode,
            page_builder: Arc::new(SnapshotPageBuilder),
            runs: RunStore::new(Arc::clone(&kv)),
            scheduler,
            fire_rx: Mutex::new(Some(fire_rx)),
            sessions: Arc::new(SessionTracker::new(Arc::clone(&kv))),
            results: Arc::new(ResultStore::new(Arc::clone(&kv), &config.store)),
            run_states: RunStateTracker::new(kv, config.store.run_state_history),
            config,
        }
    }

    /// Replace the page snapshot builder.
    #[must_use]
    pub fn with_page_builder(mut self, builder: Arc<dyn PageBuilder>) -> Self {
        self.page_builder = builder;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    #[must_use]
    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    #[must_use]
    pub fn run_states(&self) -> &RunStateTracker {
        &self.run_states
    }

    #[must_use]
    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<RunScheduler> {
        &self.scheduler
    }

    /// Ingest one lifecycle signal for `tab`.
    pub async fn push_event(&self, tab: TabId, event: Event) -> Result<()> {
        if event.kind.is_navigation_start() {
            self.scheduler.clear_finalize(tab);
            self.runs.reset(tab).await?;
            if self.config.store.clear_on_navigation {
                self.results.clear(tab).await?;
            }
            if let Some(run_id) = self.sessions.abort_session(tab, NAVIGATION).await {
                info!(tab_id = %tab, run_id = %run_id, "Navigation aborted running checks");
            }
            self.runs.add_event(tab, event).await?;
            return Ok(());
        }

        let kind = event.kind.clone();
        let (run_id, events) = self.runs.add_event(tab, event).await?;
        debug!(tab_id = %tab, run_id = %run_id, kind = %kind, events, "Event collected");
        if kind.is_navigation() {
            return Ok(());
        }
        let delay = if kind.is_dom_milestone() {
            self.config.scheduler.dom_idle_delay()
        } else {
            self.config.scheduler.settle_delay()
        };
        self.scheduler.schedule_finalize(tab, delay);
        Ok(())
    }

    /// Mark the tab's DOM as ready and arm the short deadline.
    pub async fn mark_dom_phase(&self, tab: TabId) -> Result<()> {
        let run_id = self.runs.set_dom_done(tab).await?;
        debug!(tab_id = %tab, run_id = %run_id, "DOM phase marked");
        self.scheduler
            .schedule_finalize(tab, self.config.scheduler.dom_idle_delay());
        Ok(())
    }

    /// Start the finalize loop. Fails if it is already running.
    ///
    /// Dropping the returned handle stops the loop as well.
    pub fn spawn(self: &Arc<Self>) -> Result<PipelineHandle> {
        let fire_rx = match self.fire_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut fire_rx) = fire_rx else {
            return Err(Error::Runtime("finalize loop already started".to_string()));
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pipeline = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            info!(rules = pipeline.registry.len(), "Finalize loop started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    fired = fire_rx.recv() => {
                        let Some(firing) = fired else { break };
                        // A navigation may have cleared the tab after this was sent.
                        if !pipeline.scheduler.accept(firing) {
                            continue;
                        }
                        let tab = firing.tab;
                        let pipeline = Arc::clone(&pipeline);
                        in_flight.spawn(async move {
                            if let Err(err) = pipeline.finalize(tab).await {
                                let remediation = err.remediation().map(|r| r.summary);
                                warn!(tab_id = %tab, error = %err, remediation = ?remediation, "Finalize failed");
                            }
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
            pipeline.scheduler.clear_all();
            in_flight.shutdown().await;
            info!("Finalize loop stopped");
        });

        Ok(PipelineHandle { shutdown_tx, join })
    }

    /// Execute the tab's accumulated run, if it should run.
    ///
    /// Returns the run's final state, or `None` when there was nothing to
    /// run or the guard skipped it. A skipped run is still recorded with
    /// status `skipped` and the skip reason.
    pub async fn finalize(&self, tab: TabId) -> Result<Option<RunState>> {
        let Some(run) = self.runs.pop_run(tab).await? else {
            debug!(tab_id = %tab, "No run to finalize");
            return Ok(None);
        };
        let trigger = match guard::evaluate(&run) {
            RunDecision::Execute(trigger) => trigger,
            RunDecision::Skip(reason) => {
                info!(tab_id = %tab, run_id = %run.id, reason = reason.as_str(), "Run skipped");
                self.run_states
                    .begin(tab, run.id.clone(), run.latest_url().unwrap_or_default(), None)
                    .await?;
                self.record(tab, &run.id, RunStatus::Skipped, 0, Some(reason.as_str().to_string()))
                    .await?;
                return Ok(None);
            }
        };

        let run_id = run.id.clone();
        let span = pc_span!("run", tab_id = %tab, run_id = %run_id, trigger = %trigger);
        async {
            let signal = self.sessions.start_session(tab, run_id.clone()).await;
            let page = Arc::new(self.page_builder.build(&run));
            self.run_states
                .begin(tab, run_id.clone(), page.url.clone(), Some(trigger))
                .await?;

            let placeholders = pending_placeholders(&self.registry, &run_id);
            if !placeholders.is_empty() {
                self.results
                    .merge_if_active(&self.sessions, tab, &run_id, RESULTS_KEY, &placeholders)
                    .await?;
            }

            let ctx = Arc::new(CheckContext::for_run(tab, run_id.clone()));
            let outcome = self.execute(tab, &run_id, page, ctx, signal.clone()).await;
            self.settle(tab, &run_id, outcome, &signal).await
        }
        .instrument(span)
        .await
        .map(Some)
    }

    /// Run the rules, streaming each emitted result into the store.
    async fn execute(
        &self,
        tab: TabId,
        run_id: &RunId,
        page: Arc<Page>,
        ctx: Arc<CheckContext>,
        signal: CancelSignal,
    ) -> Result<Vec<CheckResult>> {
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<CheckResult>();
        let streamer = {
            let results = Arc::clone(&self.results);
            let sessions = Arc::clone(&self.sessions);
            let run_id = run_id.clone();
            tokio::spawn(async move {
                while let Some(result) = stream_rx.recv().await {
                    let merged = results
                        .merge_if_active(&sessions, tab, &run_id, RESULTS_KEY, &[result])
                        .await;
                    if let Err(err) = merged {
                        warn!(tab_id = %tab, run_id = %run_id, error = %err, "Streamed result not stored");
                    }
                }
            })
        };

        let outcome = match &self.mode {
            ExecutionMode::Local => {
                let sink = Arc::new(ChannelSink::from_sender(stream_tx));
                self.queue
                    .run_registry(&self.registry, page, ctx, signal, sink)
                    .await
            }
            ExecutionMode::Remote(client) => client
                .run_checks(&page, &ctx, signal, Some(stream_tx))
                .await
                .map_err(Error::from),
        };
        let _ = streamer.await;
        outcome
    }

    /// Record the outcome of an executed run.
    async fn settle(
        &self,
        tab: TabId,
        run_id: &RunId,
        outcome: Result<Vec<CheckResult>>,
        signal: &CancelSignal,
    ) -> Result<RunState> {
        if let Some(reason) = signal.reason() {
            return self.record_aborted(tab, run_id, reason).await;
        }
        match outcome {
            Ok(results) => {
                let stored = self
                    .results
                    .merge_if_active(&self.sessions, tab, run_id, RESULTS_KEY, &results)
                    .await?;
                if stored.is_none() {
                    return self.record_superseded(tab, run_id, signal).await;
                }
                self.results.sweep(tab, RESULTS_KEY).await?;
                self.sessions
                    .finish_session(tab, run_id, RunStatus::Completed)
                    .await;
                info!(results = results.len(), "Run completed");
                self.record(tab, run_id, RunStatus::Completed, results.len(), None)
                    .await
            }
            Err(err) if err.is_cancelled() => {
                let reason = match err {
                    Error::Cancelled(reason) => reason,
                    other => other.to_string(),
                };
                self.record_aborted(tab, run_id, reason).await
            }
            Err(Error::Bridge(bridge_err)) => {
                warn!(
                    error = %bridge_err,
                    remediation = %bridge_err.remediation().summary,
                    "Delegated run failed"
                );
                let runner_error = runner_error_result(run_id, &bridge_err);
                self.results
                    .discard_pending(tab, RESULTS_KEY, run_id)
                    .await?;
                let stored = self
                    .results
                    .merge_if_active(&self.sessions, tab, run_id, RESULTS_KEY, &[runner_error])
                    .await?;
                if stored.is_none() {
                    return self.record_superseded(tab, run_id, signal).await;
                }
                self.results.sweep(tab, RESULTS_KEY).await?;
                self.sessions
                    .finish_session(tab, run_id, RunStatus::Error)
                    .await;
                self.record(tab, run_id, RunStatus::Error, 1, Some(bridge_err.to_string()))
                    .await
            }
            Err(err) => {
                warn!(error = %err, "Run failed");
                self.sessions
                    .finish_session(tab, run_id, RunStatus::Error)
                    .await;
                self.record(tab, run_id, RunStatus::Error, 0, Some(err.to_string()))
                    .await
            }
        }
    }

    /// The session ended between the cancellation check and the final
    /// merge, so nothing was stored.
    async fn record_superseded(
        &self,
        tab: TabId,
        run_id: &RunId,
        signal: &CancelSignal,
    ) -> Result<RunState> {
        let reason = signal
            .reason()
            .unwrap_or_else(|| "session no longer active".to_string());
        self.record_aborted(tab, run_id, reason).await
    }

    async fn record_aborted(&self, tab: TabId, run_id: &RunId, reason: String) -> Result<RunState> {
        info!(reason = %reason, "Run aborted");
        self.record(tab, run_id, RunStatus::Aborted, 0, Some(reason))
            .await
    }

    async fn record(
        &self,
        tab: TabId,
        run_id: &RunId,
        status: RunStatus,
        result_count: usize,
        reason: Option<String>,
    ) -> Result<RunState> {
        self.run_states
            .update(tab, run_id, status, result_count, reason)
            .await?
            .ok_or_else(|| Error::Runtime(format!("run state for {run_id} missing")))
    }
}

/// Handle to a running finalize loop.
#[derive(Debug)]
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PipelineHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop, cancel pending deadlines and abort in-flight runs.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join
            .await
            .map_err(|err| Error::Runtime(format!("finalize loop failed: {err}")))
    }
}
