//! Shared test infrastructure for pagecheck-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::ScriptedRule;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pagecheck_core::RuleError;
use pagecheck_core::cancel::CancelSignal;
use pagecheck_core::model::{CheckContext, CheckResult, Page};
use pagecheck_core::rules::{Rule, RuleTimeout, TimeoutClass};

/// What a scripted rule does when run.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Sleep, then succeed
    Succeed { delay_ms: u64 },
    /// Fail immediately
    Fail,
    /// Never settle
    Hang,
}

/// Rule with scripted behavior and a run counter.
pub struct ScriptedRule {
    pub id: String,
    pub enabled: bool,
    pub script: Script,
    pub timeout_ms: Option<u64>,
    pub runs: AtomicUsize,
}

impl ScriptedRule {
    pub fn new(id: impl Into<String>, script: Script) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            script,
            timeout_ms: None,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn succeed(id: impl Into<String>, delay_ms: u64) -> Arc<dyn Rule> {
        Arc::new(Self::new(id, Script::Succeed { delay_ms }))
    }

    pub fn disabled(id: impl Into<String>) -> Arc<dyn Rule> {
        Arc::new(Self {
            enabled: false,
            ..Self::new(id, Script::Fail)
        })
    }

    pub fn hanging(id: impl Into<String>, timeout_ms: u64) -> Arc<dyn Rule> {
        Arc::new(Self {
            timeout_ms: Some(timeout_ms),
            ..Self::new(id, Script::Hang)
        })
    }

    pub fn failing(id: impl Into<String>) -> Arc<dyn Rule> {
        Arc::new(Self::new(id, Script::Fail))
    }
}

#[async_trait]
impl Rule for ScriptedRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn timeout(&self) -> RuleTimeout {
        let timeout = RuleTimeout::class(TimeoutClass::Static);
        match self.timeout_ms {
            Some(ms) => timeout.with_override_ms(ms),
            None => timeout,
        }
    }

    async fn run(
        &self,
        _page: &Page,
        _ctx: &CheckContext,
        _signal: CancelSignal,
    ) -> Result<CheckResult, RuleError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Succeed { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(CheckResult::ok(self.id.clone(), "passed"))
            }
            Script::Fail => Err(RuleError::failed("scripted failure")),
            Script::Hang => std::future::pending().await,
        }
    }
}

/// Current-thread runtime with a paused clock, for use inside proptest.
pub fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime")
}
