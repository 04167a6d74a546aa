//! Bounded-concurrency rule execution.
//!
//! One run's rules execute on a small worker pool. Each task gets a result
//! slot reserved in declaration order, so the returned list is positional
//! no matter which rule finishes first; the sink, in contrast, sees results
//! in completion order as they land.
//!
//! Every task races its rule against its own timeout and the run-wide
//! cancellation signal:
//!
//! - timeout: the rule future is dropped and a `runtime_error` result takes
//!   its slot; the pool keeps going.
//! - rule error: converted into a `runtime_error` result; the pool keeps going.
//! - cancellation: the whole run unwinds with [`Error::Cancelled`]; the
//!   remaining workers are aborted and nothing further is emitted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cancel::CancelSignal;
use crate::config::QueueConfig;
use crate::error::{Error, Result, RuleError};
use crate::model::{CheckContext, CheckResult, Page, ResultType, RunId};
use crate::rules::{Rule, RuleRegistry};

/// Destination for results as soon as they are produced.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn emit(&self, result: CheckResult);
}

/// Discards every result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn emit(&self, _result: CheckResult) {}
}

/// Forwards results to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<CheckResult>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CheckResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sink feeding an existing channel.
    #[must_use]
    pub fn from_sender(tx: mpsc::UnboundedSender<CheckResult>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn emit(&self, result: CheckResult) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(result);
    }
}

/// One rule scheduled for a run, bound to its reserved output slot.
#[derive(Clone)]
pub struct Task {
    pub rule: Arc<dyn Rule>,
    /// Index of the task's entry in the returned list
    pub slot: usize,
    /// 1-based position shown in logs
    pub ordinal: usize,
    pub timeout: Duration,
}

impl Task {
    #[must_use]
    pub fn new(rule: Arc<dyn Rule>, slot: usize, config: &QueueConfig) -> Self {
        let timeout = rule.timeout().resolve(config);
        Self {
            rule,
            slot,
            ordinal: slot + 1,
            timeout,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("rule", &self.rule.id())
            .field("slot", &self.slot)
            .field("ordinal", &self.ordinal)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `pending` placeholder for each enabled rule, shown while the run executes.
#[must_use]
pub fn pending_placeholders(registry: &RuleRegistry, run_id: &RunId) -> Vec<CheckResult> {
    registry
        .rules()
        .iter()
        .filter(|rule| rule.enabled())
        .map(|rule| {
            stamp(
                CheckResult::new(ResultType::Pending, rule.name(), "Running"),
                rule.as_ref(),
                Some(run_id),
            )
        })
        .collect()
}

/// Result synthesized for a rule that is switched off.
#[must_use]
pub fn disabled_result(rule: &dyn Rule, run_id: Option<&RunId>) -> CheckResult {
    stamp(
        CheckResult::new(ResultType::Disabled, rule.name(), "Rule is disabled"),
        rule,
        run_id,
    )
    .with_priority(-1)
}

/// Attach the stable rule id, the run id and the rule's category.
fn stamp(mut result: CheckResult, rule: &dyn Rule, run_id: Option<&RunId>) -> CheckResult {
    result.rule_id = Some(rule.id().to_string());
    if let Some(run_id) = run_id {
        result.run_id = Some(run_id.clone());
    }
    if result.category.is_none() {
        result.category = rule.category().map(str::to_string);
    }
    result
}

/// Executes rule tasks on a bounded worker pool.
#[derive(Debug, Clone, Default)]
pub struct RuleQueue {
    config: QueueConfig,
}

impl RuleQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Tasks for every registered rule, in declaration order.
    #[must_use]
    pub fn tasks(&self, registry: &RuleRegistry) -> Vec<Task> {
        registry
            .rules()
            .iter()
            .enumerate()
            .map(|(slot, rule)| Task::new(Arc::clone(rule), slot, &self.config))
            .collect()
    }

    /// Run the registry's rules against `page`.
    pub async fn run_registry(
        &self,
        registry: &RuleRegistry,
        page: Arc<Page>,
        ctx: Arc<CheckContext>,
        signal: CancelSignal,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Vec<CheckResult>> {
        self.run(self.tasks(registry), page, ctx, signal, sink).await
    }

    /// Execute `tasks`, returning results ordered by slot.
    ///
    /// Slots must be distinct; unused slot indices are skipped in the output.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        page: Arc<Page>,
        ctx: Arc<CheckContext>,
        signal: CancelSignal,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Vec<CheckResult>> {
        if let Some(reason) = signal.reason() {
            return Err(Error::Cancelled(reason));
        }

        let slot_count = tasks.iter().map(|t| t.slot + 1).max().unwrap_or(0);
        let slots: Arc<Mutex<Vec<Option<CheckResult>>>> =
            Arc::new(Mutex::new(vec![None; slot_count]));

        // Disabled rules never reach the pool.
        let mut enabled = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.rule.enabled() {
                enabled.push(task);
                continue;
            }
            let result = disabled_result(task.rule.as_ref(), ctx.run_id.as_ref());
            fill_slot(&slots, task.slot, result.clone());
            sink.emit(result).await;
        }

        let enabled: Arc<[Task]> = enabled.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = self.config.concurrency.max(1).min(enabled.len());
        debug!(
            run_id = ?ctx.run_id,
            tasks = enabled.len(),
            workers,
            "Starting rule queue"
        );

        let mut join_set = JoinSet::new();
        for _ in 0..workers {
            let enabled = Arc::clone(&enabled);
            let cursor = Arc::clone(&cursor);
            let slots = Arc::clone(&slots);
            let page = Arc::clone(&page);
            let ctx = Arc::clone(&ctx);
            let signal = signal.clone();
            let sink = Arc::clone(&sink);
            join_set.spawn(async move {
                loop {
                    let next = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(task) = enabled.get(next) else {
                        return Ok::<(), Error>(());
                    };
                    let result = run_task(task, &page, &ctx, &signal).await?;
                    if let Some(reason) = signal.reason() {
                        return Err(Error::Cancelled(reason));
                    }
                    fill_slot(&slots, task.slot, result.clone());
                    sink.emit(result).await;
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => Err(Error::Runtime(format!("rule worker failed: {err}"))),
            };
            if let Err(err) = outcome {
                join_set.abort_all();
                if err.is_cancelled() {
                    debug!(run_id = ?ctx.run_id, error = %err, "Rule queue cancelled");
                } else {
                    warn!(run_id = ?ctx.run_id, error = %err, "Rule queue failed");
                }
                return Err(err);
            }
        }

        let slots = match slots.lock() {
            Ok(mut slots) => std::mem::take(&mut *slots),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        Ok(slots.into_iter().flatten().collect())
    }
}

fn fill_slot(slots: &Mutex<Vec<Option<CheckResult>>>, idx: usize, result: CheckResult) {
    match slots.lock() {
        Ok(mut slots) => slots[idx] = Some(result),
        Err(poisoned) => poisoned.into_inner()[idx] = Some(result),
    }
}

async fn run_task(
    task: &Task,
    page: &Page,
    ctx: &CheckContext,
    signal: &CancelSignal,
) -> Result<CheckResult> {
    let rule = task.rule.as_ref();
    let run_id = ctx.run_id.as_ref();
    trace!(rule_id = rule.id(), ordinal = task.ordinal, "Rule started");

    let outcome = tokio::select! {
        biased;
        reason = signal.cancelled() => return Err(Error::Cancelled(reason)),
        outcome = rule.run(page, ctx, signal.clone()) => outcome,
        () = tokio::time::sleep(task.timeout) => {
            let ms = task.timeout.as_millis() as u64;
            warn!(rule_id = rule.id(), timeout_ms = ms, "Rule timed out");
            return Ok(stamp(
                CheckResult::runtime_error(rule.name(), format!("Rule timed out after {ms}ms")),
                rule,
                run_id,
            ));
        }
    };

    match outcome {
        Ok(result) => Ok(stamp(result, rule, run_id)),
        Err(RuleError::Cancelled) if signal.is_cancelled() => {
            Err(Error::Cancelled(signal.reason().unwrap_or_default()))
        }
        Err(err) => {
            warn!(rule_id = rule.id(), error = %err, "Rule failed");
            Ok(stamp(
                CheckResult::runtime_error(rule.name(), err.to_string()),
                rule,
                run_id,
            ))
        }
    }
}
