//! Cooperative cancellation built on a `watch` channel.
//!
//! A [`CancelHandle`] is held by whoever owns the scope (the session
//! tracker, a remote job table); any number of [`CancelSignal`]s observe it.
//! Cancelling only stops waiting: work that ignores its signal keeps running
//! until it is dropped.

use std::sync::Arc;

use tokio::sync::watch;

/// Owner side of a cancellation scope.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

/// Observer side of a cancellation scope.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<String>>,
    // Keeps the channel open for signals that must never fire.
    _anchor: Option<Arc<watch::Sender<Option<String>>>>,
}

/// Create a linked handle/signal pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let handle = CancelHandle::new();
    let signal = handle.signal();
    (handle, signal)
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// New observer of this scope.
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
            _anchor: None,
        }
    }

    /// Fire the scope. Returns false if it had already been cancelled; the
    /// first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            _anchor: Some(Arc::new(tx)),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the reason once the scope is cancelled.
    ///
    /// If every handle is dropped without cancelling, this never resolves.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
