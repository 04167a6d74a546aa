//! Shared data model: lifecycle events, runs, page snapshots and results.
//!
//! Events arrive from the upstream signal source tagged with a string type
//! such as `nav:before` or `dom:idle`. They accumulate into a [`Run`] per tab
//! until the scheduler finalizes it; the run is turned into a read-only
//! [`Page`] handed unchanged to every check, and each check produces a
//! [`CheckResult`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rule id of the synthetic whole-run failure entry.
pub const RUNNER_RULE_ID: &str = "system:runner";

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Identifiers
// =============================================================================

/// Browser tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TabId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Run identifier.
///
/// Generated ids combine the creation time with a process-wide counter, so
/// they are unique within a process and sort by creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl RunId {
    /// Generate a fresh run id.
    #[must_use]
    pub fn generate() -> Self {
        let counter = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("run-{:x}-{counter:06x}", now_ms()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Type tag of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// Navigation is about to start
    NavBefore,
    /// Navigation committed
    NavCommit,
    /// History API (same-document) navigation
    NavHistory,
    /// Server or client redirect hop
    NavRedirect,
    /// Response headers arrived
    HttpHeaders,
    /// DOM snapshot carrying the document
    DomSnapshot,
    /// DOMContentLoaded milestone
    DomReady,
    /// DOM went idle; carries the document
    DomIdle,
    /// Unrecognized tag, kept verbatim
    Other(String),
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::NavBefore => "nav:before",
            Self::NavCommit => "nav:commit",
            Self::NavHistory => "nav:history",
            Self::NavRedirect => "nav:redirect",
            Self::HttpHeaders => "http:headers",
            Self::DomSnapshot => "dom:snapshot",
            Self::DomReady => "dom:ready",
            Self::DomIdle => "dom:idle",
            Self::Other(tag) => tag,
        }
    }

    /// Navigation-type events invalidate any earlier DOM snapshot.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            Self::NavBefore | Self::NavCommit | Self::NavHistory | Self::NavRedirect
        )
    }

    /// The navigation-start signal that resets a tab's pipeline.
    #[must_use]
    pub fn is_navigation_start(&self) -> bool {
        matches!(self, Self::NavBefore)
    }

    /// Events whose payload is a usable document snapshot.
    #[must_use]
    pub fn is_dom_snapshot(&self) -> bool {
        matches!(self, Self::DomSnapshot | Self::DomIdle)
    }

    /// DOM milestones re-arm the short finalize deadline.
    #[must_use]
    pub fn is_dom_milestone(&self) -> bool {
        matches!(self, Self::DomSnapshot | Self::DomReady | Self::DomIdle)
    }
}

impl From<String> for EventKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "nav:before" => Self::NavBefore,
            "nav:commit" => Self::NavCommit,
            "nav:history" => Self::NavHistory,
            "nav:redirect" => Self::NavRedirect,
            "http:headers" => Self::HttpHeaders,
            "dom:snapshot" => Self::DomSnapshot,
            "dom:ready" => Self::DomReady,
            "dom:idle" => Self::DomIdle,
            _ => Self::Other(tag),
        }
    }
}

impl From<&str> for EventKind {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw lifecycle signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Arrival time (epoch ms)
    #[serde(default = "now_ms")]
    pub at_ms: u64,
}

impl Event {
    #[must_use]
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            kind: kind.into(),
            url: None,
            headers: BTreeMap::new(),
            status: None,
            payload: None,
            at_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Document html carried by the payload, either `{"html": ...}` or a bare string.
    #[must_use]
    pub fn html(&self) -> Option<&str> {
        match self.payload.as_ref()? {
            Value::String(html) => Some(html),
            Value::Object(map) => map.get("html").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// An accumulating batch of events for one tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub events: Vec<Event>,
    #[serde(default)]
    pub dom_done: bool,
    pub created_at_ms: u64,
}

impl Run {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: RunId::generate(),
            events: Vec::new(),
            dom_done: false,
            created_at_ms: now_ms(),
        }
    }

    /// Index of the last DOM-snapshot event.
    #[must_use]
    pub fn last_dom_snapshot(&self) -> Option<usize> {
        self.events.iter().rposition(|e| e.kind.is_dom_snapshot())
    }

    /// Latest url seen in the event list.
    #[must_use]
    pub fn latest_url(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|e| e.url.as_deref())
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a run was executed, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerReason {
    #[serde(rename = "nav:before")]
    NavBefore,
    #[serde(rename = "nav:commit")]
    NavCommit,
    #[serde(rename = "nav:history")]
    NavHistory,
    #[serde(rename = "dom:idle")]
    DomIdle,
    #[serde(rename = "auto")]
    Auto,
}

impl TriggerReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NavBefore => "nav:before",
            Self::NavCommit => "nav:commit",
            Self::NavHistory => "nav:history",
            Self::DomIdle => "dom:idle",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status shared by sessions and run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Aborted,
    Completed,
    Error,
    Skipped,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome class of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Ok,
    Warn,
    Error,
    Info,
    RuntimeError,
    Pending,
    Disabled,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ResultType,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "ruleId", skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CheckResult {
    #[must_use]
    pub fn new(kind: ResultType, name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            message: message.into(),
            kind,
            priority: 0,
            rule_id: None,
            run_id: None,
            category: None,
            details: None,
        }
    }

    #[must_use]
    pub fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ResultType::Ok, name, message)
    }

    #[must_use]
    pub fn warn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ResultType::Warn, name, message)
    }

    #[must_use]
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ResultType::Error, name, message)
    }

    #[must_use]
    pub fn runtime_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ResultType::RuntimeError, name, message).with_priority(100)
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.kind == ResultType::Pending
    }

    /// The synthetic whole-run failure banner.
    #[must_use]
    pub fn is_runner_error(&self) -> bool {
        self.rule_id.as_deref() == Some(RUNNER_RULE_ID)
            && matches!(self.kind, ResultType::Error | ResultType::RuntimeError)
    }

    /// Identity used by placeholder replacement: rule id, falling back to name.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.rule_id.as_deref().unwrap_or(&self.name)
    }
}

// =============================================================================
// Page snapshot
// =============================================================================

/// Timing marks derived from event arrival.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTiming {
    pub navigation_start_ms: Option<u64>,
    pub dom_snapshot_ms: Option<u64>,
}

/// Read-only page snapshot passed to every check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    pub html: String,
    pub headers: BTreeMap<String, String>,
    pub status: Option<u16>,
    pub timing: PageTiming,
}

impl Page {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Builds the page snapshot for a finalized run.
pub trait PageBuilder: Send + Sync {
    fn build(&self, run: &Run) -> Page;
}

/// Default builder: url from the latest event that carries one, html from the
/// last DOM snapshot, headers and status from the last header arrival.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotPageBuilder;

impl PageBuilder for SnapshotPageBuilder {
    fn build(&self, run: &Run) -> Page {
        let snapshot = run.last_dom_snapshot().map(|idx| &run.events[idx]);
        let header_event = run
            .events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::HttpHeaders);
        Page {
            url: run.latest_url().unwrap_or_default().to_string(),
            html: snapshot
                .and_then(Event::html)
                .unwrap_or_default()
                .to_string(),
            headers: header_event.map(|e| e.headers.clone()).unwrap_or_default(),
            status: header_event.and_then(|e| e.status),
            timing: PageTiming {
                navigation_start_ms: run
                    .events
                    .iter()
                    .find(|e| e.kind.is_navigation_start())
                    .map(|e| e.at_ms),
                dom_snapshot_ms: snapshot.map(|e| e.at_ms),
            },
        }
    }
}

/// Per-run context handed to checks alongside the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckContext {
    pub tab_id: Option<TabId>,
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl CheckContext {
    #[must_use]
    pub fn for_run(tab_id: TabId, run_id: RunId) -> Self {
        Self {
            tab_id: Some(tab_id),
            run_id: Some(run_id),
            variables: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle metadata of one run, for observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub tab_id: TabId,
    pub url: String,
    pub trigger: Option<TriggerReason>,
    pub status: RunStatus,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub result_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
