//! pagecheck-core: Core library for pagecheck
//!
//! This crate turns a noisy stream of browser lifecycle signals into
//! well-defined check runs, executes the checks of each run under per-check
//! timeouts and whole-run cancellation, and merges the streamed results into
//! a durable per-tab store.
//!
//! # Architecture
//!
//! ```text
//! Signal source → RunStore (accumulate) → RunScheduler (debounce)
//!                                              ↓
//!                                  Run Guard → SessionTracker
//!                                                   ↓
//!                     RuleQueue (local) / BridgeClient ⇄ RemoteRunner
//!                                                   ↓
//!                                           ResultStore (merge)
//! ```
//!
//! # Modules
//!
//! - `model`: Events, runs, page snapshots and check results
//! - `run_store`: Per-tab accumulating runs
//! - `scheduler`: Per-tab debounce deadlines
//! - `guard`: Finalize-time staleness check and trigger derivation
//! - `cancel`: Cancellation handles and signals
//! - `session`: One cancellation-scoped session per tab
//! - `run_state`: Run lifecycle records for observers
//! - `rules`: The rule capability and registry
//! - `queue`: Bounded-concurrency rule execution
//! - `bridge`: Correlated request/response over an async message channel
//! - `store`: Key-value persistence backends
//! - `merge`: Result merging, dedup, degradation and retention
//! - `pipeline`: Wires the components into the run lifecycle
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod rules;
pub mod run_state;
pub mod run_store;
pub mod scheduler;
pub mod session;
pub mod store;

pub use error::{BridgeError, ConfigError, Error, Result, RuleError, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
