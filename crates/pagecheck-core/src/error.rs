//! Error types for pagecheck-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);
        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pagecheck-core
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Cross-context bridge errors
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The whole run was cancelled; callers must treat this as "no results"
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, join errors, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Whether this error is the whole-run cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Bridge(BridgeError::Cancelled))
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Bridge(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Cancelled(_) => None,
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the stored JSON and retry.")
                    .alternative("Clear the affected tab's stored results."),
            ),
            Self::Runtime(_) => None,
        }
    }
}

/// Key-value store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write would exceed the store's size quota
    #[error("Quota exceeded writing {key}: {bytes} bytes > {limit} bytes")]
    QuotaExceeded {
        key: String,
        bytes: usize,
        limit: usize,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stored value for {key} is not valid JSON: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Whether a smaller write might succeed.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::QuotaExceeded { .. } => {
                Remediation::new("Stored results exceed the quota; older entries will be trimmed.")
                    .alternative("Lower store.retain_runs or raise the store quota.")
            }
            Self::Database(_) => Remediation::new("Database operation failed. Check permissions and retry.")
                .alternative("Ensure the database directory is writable."),
            Self::Corrupt { key, .. } => Remediation::new(format!("Remove the corrupt entry {key}."))
                .alternative("Clearing the tab resets its stored state."),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Cross-context bridge errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The isolated context cannot be reached (send failed or channel closed)
    #[error("Isolated context unavailable: {0}")]
    Unavailable(String),

    /// No reply arrived before the call's deadline
    #[error("Bridge call timed out after {0} ms")]
    Timeout(u64),

    /// The caller's cancellation signal fired first
    #[error("Bridge call cancelled")]
    Cancelled,

    /// The remote side replied with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// The reply could not be decoded
    #[error("Malformed reply: {0}")]
    Malformed(String),
}

impl BridgeError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable(_) => Remediation::new("Restart the isolated execution context.")
                .alternative("Check that the context's message port is attached."),
            Self::Timeout(_) => Remediation::new("The isolated context did not answer in time.")
                .alternative("Raise bridge.default_timeout_ms for slow pages."),
            Self::Cancelled => Remediation::new("The run was superseded; no action needed."),
            Self::Remote(_) | Self::Malformed(_) => {
                Remediation::new("Inspect the isolated context's logs for the failing job.")
            }
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!("Create the config file at {path}."))
                .alternative("Omit the path to run with defaults."),
            Self::ReadFailed { .. } => Remediation::new("Check the config file's permissions."),
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax error and retry."),
            Self::ValidationError(_) => Remediation::new("Adjust the reported value to its allowed range."),
        }
    }
}

/// Errors raised by a rule's own execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("{0}")]
    Failed(String),

    #[error("Rule cancelled")]
    Cancelled,
}

impl RuleError {
    /// Convenience constructor for a failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
