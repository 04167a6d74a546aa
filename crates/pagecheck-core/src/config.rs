//! Configuration management for pagecheck
//!
//! Handles loading and validation of pagecheck.toml configuration files.
//! Every section is optional; omitted values fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly colored output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Finalize deadline settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Rule execution queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Cross-context bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Result store settings
    #[serde(default)]
    pub store: StoreConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Run scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay armed after each DOM milestone (debounced idle detection)
    #[serde(default = "default_dom_idle_delay_ms")]
    pub dom_idle_delay_ms: u64,

    /// Delay armed after non-DOM events so pages without milestones still run
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dom_idle_delay_ms: default_dom_idle_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn dom_idle_delay(&self) -> Duration {
        Duration::from_millis(self.dom_idle_delay_ms)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_dom_idle_delay_ms() -> u64 {
    150
}

fn default_settle_delay_ms() -> u64 {
    1_500
}

/// Rule execution queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum rules in flight per run
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout for synchronous/static checks
    #[serde(default = "default_static_timeout_ms")]
    pub static_timeout_ms: u64,

    /// Timeout for checks backed by a remote API
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,

    /// Timeout for multi-page/crawl-style checks
    #[serde(default = "default_crawl_timeout_ms")]
    pub crawl_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            static_timeout_ms: default_static_timeout_ms(),
            api_timeout_ms: default_api_timeout_ms(),
            crawl_timeout_ms: default_crawl_timeout_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_static_timeout_ms() -> u64 {
    15_000
}

fn default_api_timeout_ms() -> u64 {
    60_000
}

fn default_crawl_timeout_ms() -> u64 {
    600_000
}

/// Cross-context bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Channel name stamped on every envelope
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Per-call timeout
    #[serde(default = "default_bridge_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-call timeout for slow-class work (whole delegated runs)
    #[serde(default = "default_slow_timeout_ms")]
    pub slow_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            default_timeout_ms: default_bridge_timeout_ms(),
            slow_timeout_ms: default_slow_timeout_ms(),
        }
    }
}

fn default_channel() -> String {
    "pagecheck".to_string()
}

fn default_bridge_timeout_ms() -> u64 {
    15_000
}

fn default_slow_timeout_ms() -> u64 {
    120_000
}

/// Result store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Clear persisted results when a navigation starts
    #[serde(default = "default_true")]
    pub clear_on_navigation: bool,

    /// Distinct run ids kept per tab by the retention sweep
    #[serde(default = "default_retain_runs")]
    pub retain_runs: usize,

    /// Entries kept by the last degradation step (clamped to 10..=100)
    #[serde(default = "default_degrade_window")]
    pub degrade_window: usize,

    /// RunState records kept per tab
    #[serde(default = "default_run_state_history")]
    pub run_state_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clear_on_navigation: true,
            retain_runs: default_retain_runs(),
            degrade_window: default_degrade_window(),
            run_state_history: default_run_state_history(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retain_runs() -> usize {
    3
}

fn default_degrade_window() -> usize {
    50
}

fn default_run_state_history() -> usize {
    10
}

/// Bounds for explicit per-rule timeout overrides.
pub const MIN_RULE_TIMEOUT_MS: u64 = 1_000;
pub const MAX_RULE_TIMEOUT_MS: u64 = 600_000;

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::ParseError(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "queue.concurrency must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("queue.static_timeout_ms", self.queue.static_timeout_ms),
            ("queue.api_timeout_ms", self.queue.api_timeout_ms),
            ("queue.crawl_timeout_ms", self.queue.crawl_timeout_ms),
        ] {
            if !(MIN_RULE_TIMEOUT_MS..=MAX_RULE_TIMEOUT_MS).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be within [{MIN_RULE_TIMEOUT_MS}, {MAX_RULE_TIMEOUT_MS}], got {value}"
                )));
            }
        }
        if self.bridge.default_timeout_ms == 0 || self.bridge.slow_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "bridge timeouts must be non-zero".to_string(),
            ));
        }
        if self.bridge.channel.is_empty() {
            return Err(ConfigError::ValidationError(
                "bridge.channel must not be empty".to_string(),
            ));
        }
        if self.store.retain_runs == 0 {
            return Err(ConfigError::ValidationError(
                "store.retain_runs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
