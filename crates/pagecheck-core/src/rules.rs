//! Rule capability and registry.
//!
//! A rule is an independent async check over the read-only [`Page`]. Rules
//! are registered once at startup, in declaration order; that order fixes
//! the position of every rule's result in the output list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;
use crate::config::{MAX_RULE_TIMEOUT_MS, MIN_RULE_TIMEOUT_MS, QueueConfig};
use crate::error::RuleError;
use crate::model::{CheckContext, CheckResult, Page};

// =============================================================================
// Timeouts
// =============================================================================

/// Cost class used to pick a rule's default timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    /// Pure inspection of the page
    #[default]
    Static,
    /// Calls an external API
    Api,
    /// Fetches further pages
    Crawl,
}

/// Timeout declaration of a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTimeout {
    pub class: TimeoutClass,
    /// Explicit timeout; honoured only within the allowed bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_ms: Option<u64>,
}

impl RuleTimeout {
    #[must_use]
    pub const fn class(class: TimeoutClass) -> Self {
        Self {
            class,
            override_ms: None,
        }
    }

    #[must_use]
    pub const fn with_override_ms(mut self, ms: u64) -> Self {
        self.override_ms = Some(ms);
        self
    }

    /// Effective timeout: an in-range override, else the class default.
    #[must_use]
    pub fn resolve(&self, config: &QueueConfig) -> Duration {
        let ms = match self.override_ms {
            Some(ms) if (MIN_RULE_TIMEOUT_MS..=MAX_RULE_TIMEOUT_MS).contains(&ms) => ms,
            _ => match self.class {
                TimeoutClass::Static => config.static_timeout_ms,
                TimeoutClass::Api => config.api_timeout_ms,
                TimeoutClass::Crawl => config.crawl_timeout_ms,
            },
        };
        Duration::from_millis(ms)
    }
}

// =============================================================================
// Rule trait
// =============================================================================

/// An independent check over a page snapshot.
///
/// `run` receives the run's cancellation signal; long-running rules should
/// select on it, but a rule that ignores it is simply no longer awaited once
/// the run is cancelled.
#[async_trait]
pub trait Rule: Send + Sync + 'static {
    /// Stable identifier, used to match results across runs
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn category(&self) -> Option<&str> {
        None
    }

    fn timeout(&self) -> RuleTimeout {
        RuleTimeout::default()
    }

    async fn run(
        &self,
        page: &Page,
        ctx: &CheckContext,
        signal: CancelSignal,
    ) -> Result<CheckResult, RuleError>;
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered set of rules.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. A rule whose id is already registered replaces the
    /// earlier one in place.
    pub fn register(&mut self, rule: Arc<dyn Rule>) -> &mut Self {
        let existing = self.rules.iter().position(|r| r.id() == rule.id());
        match existing {
            Some(idx) => self.rules[idx] = rule,
            None => self.rules.push(rule),
        }
        self
    }

    #[must_use]
    pub fn with(mut self, rule: Arc<dyn Rule>) -> Self {
        self.register(rule);
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Rule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    #[must_use]
    pub fn enabled_ids(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.enabled())
            .map(|r| r.id())
            .collect()
    }

    #[must_use]
    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.rules.iter().map(|r| r.id()).collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Built-in rules
// =============================================================================

/// Checks that the document has a non-empty `<title>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitleRule;

fn extract_title(html: &str) -> Option<&str> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title")?;
    Some(html[start..end].trim())
}

#[async_trait]
impl Rule for TitleRule {
    fn id(&self) -> &str {
        "core:title"
    }

    fn name(&self) -> &str {
        "Title"
    }

    fn category(&self) -> Option<&str> {
        Some("content")
    }

    async fn run(
        &self,
        page: &Page,
        _ctx: &CheckContext,
        _signal: CancelSignal,
    ) -> Result<CheckResult, RuleError> {
        Ok(match extract_title(&page.html) {
            Some(title) if !title.is_empty() => {
                CheckResult::ok(self.name(), format!("Title: {title}"))
            }
            Some(_) => CheckResult::warn(self.name(), "Title is empty"),
            None => CheckResult::error(self.name(), "Document has no <title>"),
        })
    }
}

/// Reports the document's HTTP status.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpStatusRule;

#[async_trait]
impl Rule for HttpStatusRule {
    fn id(&self) -> &str {
        "core:http-status"
    }

    fn name(&self) -> &str {
        "HTTP status"
    }

    fn category(&self) -> Option<&str> {
        Some("http")
    }

    async fn run(
        &self,
        page: &Page,
        _ctx: &CheckContext,
        _signal: CancelSignal,
    ) -> Result<CheckResult, RuleError> {
        Ok(match page.status {
            Some(status @ 200..=299) => CheckResult::ok(self.name(), format!("HTTP {status}")),
            Some(status @ 300..=399) => CheckResult::warn(self.name(), format!("HTTP {status}")),
            Some(status) => CheckResult::error(self.name(), format!("HTTP {status}")),
            None => CheckResult::new(
                crate::model::ResultType::Info,
                self.name(),
                "No response headers observed",
            ),
        })
    }
}

/// Registry holding the built-in rules.
#[must_use]
pub fn builtin_registry() -> RuleRegistry {
    RuleRegistry::new()
        .with(Arc::new(TitleRule))
        .with(Arc::new(HttpStatusRule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultType;

    struct Named(&'static str, bool);

    #[async_trait]
    impl Rule for Named {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            self.0
        }
        fn enabled(&self) -> bool {
            self.1
        }
        async fn run(
            &self,
            _page: &Page,
            _ctx: &CheckContext,
            _signal: CancelSignal,
        ) -> Result<CheckResult, RuleError> {
            Ok(CheckResult::ok(self.0, ""))
        }
    }

    #[test]
    fn timeout_classes_resolve_to_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(
            RuleTimeout::class(TimeoutClass::Static).resolve(&config),
            Duration::from_secs(15)
        );
        assert_eq!(
            RuleTimeout::class(TimeoutClass::Api).resolve(&config),
            Duration::from_secs(60)
        );
        assert_eq!(
            RuleTimeout::class(TimeoutClass::Crawl).resolve(&config),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn override_only_honoured_in_range() {
        let config = QueueConfig::default();
        let api = RuleTimeout::class(TimeoutClass::Api);
        assert_eq!(
            api.with_override_ms(2_500).resolve(&config),
            Duration::from_millis(2_500)
        );
        assert_eq!(
            api.with_override_ms(999).resolve(&config),
            Duration::from_secs(60)
        );
        assert_eq!(
            api.with_override_ms(600_001).resolve(&config),
            Duration::from_secs(60)
        );
        assert_eq!(
            api.with_override_ms(600_000).resolve(&config),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn registry_keeps_order_and_replaces_by_id() {
        let mut registry = RuleRegistry::new();
        registry
            .register(Arc::new(Named("a", true)))
            .register(Arc::new(Named("b", false)))
            .register(Arc::new(Named("c", true)));
        registry.register(Arc::new(Named("b", true)));

        let ids: Vec<&str> = registry.rules().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.enabled_ids(), vec!["a", "b", "c"]);
        assert!(registry.get("c").is_some());
        assert!(registry.get("z").is_none());
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn title_extraction() {
        assert_eq!(extract_title("<html><TITLE>Hi there</TITLE>"), Some("Hi there"));
        assert_eq!(extract_title("<title lang=\"en\"> x </title>"), Some("x"));
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn builtin_rules_classify_page() {
        let page = Page {
            html: "<title>Home</title>".to_string(),
            status: Some(404),
            ..Page::default()
        };
        let ctx = CheckContext::default();
        let title = TitleRule.run(&page, &ctx, CancelSignal::never()).await.unwrap();
        let status = HttpStatusRule
            .run(&page, &ctx, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(title.kind, ResultType::Ok);
        assert_eq!(status.kind, ResultType::Error);
        assert_eq!(builtin_registry().len(), 2);
    }
}
