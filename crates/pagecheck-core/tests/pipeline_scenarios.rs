//! End-to-end pipeline scenarios.
//!
//! Each test drives a [`Pipeline`] the way a browser host would, by pushing
//! lifecycle events and letting the finalize loop run, then inspects the
//! stored results, sessions and run states.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::ScriptedRule;
use pagecheck_core::RuleError;
use pagecheck_core::bridge::{BridgeClient, DEFAULT_CHANNEL, RemoteRunner, in_memory_pair};
use pagecheck_core::cancel::CancelSignal;
use pagecheck_core::config::{BridgeConfig, Config, QueueConfig};
use pagecheck_core::merge::RESULTS_KEY;
use pagecheck_core::model::{
    CheckContext, CheckResult, Event, Page, RUNNER_RULE_ID, ResultType, RunId, RunStatus, TabId,
    TriggerReason,
};
use pagecheck_core::pipeline::{ExecutionMode, NAVIGATION, Pipeline};
use pagecheck_core::queue::RuleQueue;
use pagecheck_core::rules::{Rule, RuleRegistry};
use pagecheck_core::session::{SUPERSEDED, SessionTracker};
use pagecheck_core::store::{KvStore, MemoryStore, SqliteStore};

fn page_events(url: &str) -> Vec<Event> {
    vec![
        Event::new("nav:before").with_url(url),
        Event::new("dom:idle").with_payload(json!({"html": "<title>H</title>"})),
    ]
}

fn three_and_one_disabled() -> RuleRegistry {
    RuleRegistry::new()
        .with(ScriptedRule::succeed("check:a", 20))
        .with(ScriptedRule::succeed("check:b", 5))
        .with(ScriptedRule::disabled("check:off"))
        .with(ScriptedRule::succeed("check:c", 40))
}

fn local_pipeline(registry: RuleRegistry, config: Config) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        config,
        registry,
        Arc::new(MemoryStore::new()),
        ExecutionMode::Local,
    ))
}

async fn push_all(pipeline: &Pipeline, tab: TabId, events: Vec<Event>) {
    for event in events {
        pipeline.push_event(tab, event).await.unwrap();
    }
}

/// Rule that hangs, recording the cancellation reason its signal delivers.
struct Observer {
    seen: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl Rule for Observer {
    fn id(&self) -> &str {
        "test:observer"
    }

    fn name(&self) -> &str {
        "Observer"
    }

    async fn run(
        &self,
        _page: &Page,
        _ctx: &CheckContext,
        signal: CancelSignal,
    ) -> Result<CheckResult, RuleError> {
        // The queue drops this future on cancellation, so watch from a task.
        let seen = Arc::clone(&self.seen);
        tokio::spawn(async move {
            let reason = signal.cancelled().await;
            *seen.lock().unwrap() = Some(reason);
        });
        std::future::pending().await
    }
}

// ────────────────────────────────────────────────────────────────────
// Local execution
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_page_yields_one_result_per_rule() {
    let pipeline = local_pipeline(three_and_one_disabled(), Config::default());
    let handle = pipeline.spawn().unwrap();
    let tab = TabId(1);

    push_all(&pipeline, tab, page_events("https://a.test/")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    assert_eq!(results.len(), 4);
    let run_id = results[0].run_id.clone().unwrap();
    assert!(results.iter().all(|r| r.run_id.as_ref() == Some(&run_id)));
    assert_eq!(
        results
            .iter()
            .filter(|r| r.kind == ResultType::Disabled)
            .count(),
        1
    );
    assert_eq!(
        results.iter().filter(|r| r.kind == ResultType::Ok).count(),
        3
    );
    assert!(!results.iter().any(CheckResult::is_pending));

    let state = pipeline.run_states().latest(tab).await.unwrap().unwrap();
    assert_eq!(state.run_id, run_id);
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.result_count, 4);
    assert!(!pipeline.sessions().is_session_active(tab, None));
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn event_burst_produces_a_single_run() {
    let pipeline = local_pipeline(three_and_one_disabled(), Config::default());
    let handle = pipeline.spawn().unwrap();
    let tab = TabId(2);

    pipeline
        .push_event(tab, Event::new("nav:before").with_url("https://a.test/"))
        .await
        .unwrap();
    for _ in 0..5 {
        pipeline
            .push_event(
                tab,
                Event::new("dom:snapshot").with_payload(json!({"html": "<p/>"})),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let history = pipeline.run_states().history(tab).await.unwrap();
    assert_eq!(history.len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn navigation_cancels_rules_with_its_reason() {
    let seen = Arc::new(Mutex::new(None));
    let registry = RuleRegistry::new().with(Arc::new(Observer {
        seen: Arc::clone(&seen),
    }));
    let pipeline = local_pipeline(registry, Config::default());
    let tab = TabId(3);
    push_all(&pipeline, tab, page_events("https://a.test/")).await;

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.finalize(tab).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline
        .push_event(tab, Event::new("nav:before").with_url("https://b.test/"))
        .await
        .unwrap();

    let state = running.await.unwrap().unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Aborted);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(seen.lock().unwrap().as_deref(), Some(NAVIGATION));
}

#[tokio::test(start_paused = true)]
async fn results_of_an_aborted_run_stop_landing() {
    let mut config = Config::default();
    config.store.clear_on_navigation = false;
    let registry = RuleRegistry::new()
        .with(ScriptedRule::succeed("check:fast", 10))
        .with(ScriptedRule::succeed("check:slow", 5_000));
    let pipeline = local_pipeline(registry, config);
    let tab = TabId(4);
    push_all(&pipeline, tab, page_events("https://a.test/")).await;

    let running = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.finalize(tab).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let old_run = pipeline.sessions().active_run(tab).unwrap();

    pipeline
        .push_event(tab, Event::new("nav:before").with_url("https://b.test/"))
        .await
        .unwrap();
    assert!(!pipeline.sessions().is_session_active(tab, Some(&old_run)));
    running.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    let fast = results
        .iter()
        .find(|r| r.identity() == "check:fast")
        .unwrap();
    assert_eq!(fast.kind, ResultType::Ok);
    let slow = results
        .iter()
        .find(|r| r.identity() == "check:slow")
        .unwrap();
    assert_eq!(slow.kind, ResultType::Pending);

    let session = pipeline.sessions().snapshot(tab).await.unwrap().unwrap();
    assert_eq!(session.run_id, old_run);
    assert_eq!(session.status, RunStatus::Aborted);
    assert_eq!(session.reason.as_deref(), Some(NAVIGATION));
}

#[tokio::test(start_paused = true)]
async fn navigation_invalidates_a_firing_still_queued() {
    let pipeline = local_pipeline(
        RuleRegistry::new().with(ScriptedRule::succeed("check:a", 1)),
        Config::default(),
    );
    let tab = TabId(9);

    // The old page's deadline fires while nothing consumes firings yet.
    push_all(&pipeline, tab, page_events("https://old.test/")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pipeline.scheduler().is_scheduled(tab));

    pipeline
        .push_event(tab, Event::new("nav:before").with_url("https://new.test/"))
        .await
        .unwrap();
    let handle = pipeline.spawn().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pipeline.runs().peek(tab).await.unwrap().unwrap().events.len(), 1);

    pipeline
        .push_event(
            tab,
            Event::new("dom:idle").with_payload(json!({"html": "<title>N</title>"})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let history = pipeline.run_states().history(tab).await.unwrap();
    assert_eq!(history.len(), 1);
    let state = &history[0];
    assert_eq!(state.url, "https://new.test/");
    assert_eq!(state.trigger, Some(TriggerReason::NavBefore));
    assert_eq!(state.status, RunStatus::Completed);
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn skipped_runs_are_recorded() {
    let pipeline = local_pipeline(three_and_one_disabled(), Config::default());
    let handle = pipeline.spawn().unwrap();
    let tab = TabId(10);

    // Headers alone arm the settle deadline but carry no document.
    pipeline
        .push_event(tab, Event::new("nav:before").with_url("https://a.test/"))
        .await
        .unwrap();
    pipeline
        .push_event(tab, Event::new("http:headers").with_status(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let state = pipeline.run_states().latest(tab).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Skipped);
    assert_eq!(state.reason.as_deref(), Some("no_snapshot"));
    assert_eq!(state.result_count, 0);
    assert!(pipeline.results().load(tab, RESULTS_KEY).await.unwrap().is_empty());
    assert!(!pipeline.sessions().is_session_active(tab, None));
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn at_most_one_session_per_tab() {
    let sessions = SessionTracker::new(Arc::new(MemoryStore::new()));
    let first = sessions.start_session(TabId(1), RunId::from("r1")).await;
    let _second = sessions.start_session(TabId(1), RunId::from("r2")).await;
    let _other = sessions.start_session(TabId(2), RunId::from("r3")).await;

    assert_eq!(sessions.active_count(), 2);
    assert_eq!(first.reason().as_deref(), Some(SUPERSEDED));
    assert!(!sessions.is_session_active(TabId(1), Some(&RunId::from("r1"))));
    assert!(sessions.is_session_active(TabId(1), Some(&RunId::from("r2"))));
}

#[tokio::test(start_paused = true)]
async fn retention_keeps_three_runs() {
    let mut config = Config::default();
    config.store.clear_on_navigation = false;
    let pipeline = local_pipeline(
        RuleRegistry::new().with(ScriptedRule::succeed("check:a", 1)),
        config,
    );
    let tab = TabId(5);
    for n in 0..5 {
        push_all(&pipeline, tab, page_events(&format!("https://a.test/{n}"))).await;
        pipeline.finalize(tab).await.unwrap().unwrap();
    }
    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    assert_eq!(results.len(), 3);
}

// ────────────────────────────────────────────────────────────────────
// Remote execution
// ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn remote_runner_streams_results_into_store() {
    let (client_end, remote_end) = in_memory_pair();
    let runner = RemoteRunner::new(
        three_and_one_disabled(),
        RuleQueue::new(QueueConfig::default()),
        remote_end.port,
        DEFAULT_CHANNEL,
    );
    let server = runner.spawn(remote_end.inbound);
    let client = BridgeClient::new(client_end, &BridgeConfig::default());

    let pipeline = Arc::new(Pipeline::new(
        Config::default(),
        three_and_one_disabled(),
        Arc::new(MemoryStore::new()),
        ExecutionMode::Remote(client),
    ));
    let tab = TabId(6);
    push_all(&pipeline, tab, page_events("https://a.test/")).await;

    let state = pipeline.finalize(tab).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.result_count, 4);

    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.run_id.as_ref() == Some(&state.run_id)));
    assert!(!results.iter().any(CheckResult::is_pending));
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn unavailable_runner_leaves_single_error_entry() {
    let (client_end, remote_end) = in_memory_pair();
    drop(remote_end);
    let client = BridgeClient::new(client_end, &BridgeConfig::default());

    let pipeline = Arc::new(Pipeline::new(
        Config::default(),
        three_and_one_disabled(),
        Arc::new(MemoryStore::new()),
        ExecutionMode::Remote(client),
    ));
    let tab = TabId(7);
    push_all(&pipeline, tab, page_events("https://a.test/")).await;

    let state = pipeline.finalize(tab).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Error);

    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rule_id.as_deref(), Some(RUNNER_RULE_ID));
    assert_eq!(results[0].kind, ResultType::Error);
    assert!(results[0].message.starts_with("Check runner unavailable"));
}

// ────────────────────────────────────────────────────────────────────
// Durable store
// ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sqlite_backed_results_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pagecheck.db");
    let tab = TabId(8);

    {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let pipeline = Pipeline::new(
            Config::default(),
            RuleRegistry::new().with(ScriptedRule::succeed("check:a", 0)),
            kv,
            ExecutionMode::Local,
        );
        push_all(&pipeline, tab, page_events("https://a.test/")).await;
        let state = pipeline.finalize(tab).await.unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Completed);
    }

    let kv: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let pipeline = Pipeline::new(
        Config::default(),
        RuleRegistry::new(),
        kv,
        ExecutionMode::Local,
    );
    let results = pipeline.results().load(tab, RESULTS_KEY).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].identity(), "check:a");
    let state = pipeline.run_states().latest(tab).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}
