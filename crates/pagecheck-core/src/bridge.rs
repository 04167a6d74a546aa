//! Correlation-id RPC between the coordinating context and an isolated one.
//!
//! Both sides exchange [`Envelope`]s over a [`Port`]. A request carries a
//! fresh random id; the remote answers with any number of chunk envelopes
//! (`chunk: true`) followed by exactly one final envelope carrying `data` or
//! `error`, all addressed with `replyTo`. A caller that gives up (deadline
//! or cancellation) tells the remote with a `control: "cancel"` envelope
//! naming the request in `target`.
//!
//! The client runs a single demux task per inbound stream. It routes chunks
//! to the caller's chunk channel and settles the call's oneshot on the final
//! reply. Whatever happens, a call settles exactly once and its pending
//! entry is removed when it does; replies that arrive afterwards are
//! dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::model::{CheckContext, CheckResult, Page, RUNNER_RULE_ID, RunId, TabId};
use crate::queue::{ResultSink, RuleQueue};
use crate::rules::RuleRegistry;

/// Default envelope channel name.
pub const DEFAULT_CHANNEL: &str = "pagecheck";

/// Buffer size of in-memory port channels.
pub const PORT_CAPACITY: usize = 256;

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

// =============================================================================
// Wire format
// =============================================================================

/// Out-of-band control verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Cancel,
}

/// One message on the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, rename = "tabId", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<Control>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    fn empty(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            id: None,
            reply_to: None,
            tab_id: None,
            chunk: None,
            data: None,
            error: None,
            control: None,
            target: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn request(channel: &str, id: String, tab_id: Option<TabId>, payload: Value) -> Self {
        Self {
            id: Some(id),
            tab_id,
            payload: Some(payload),
            ..Self::empty(channel)
        }
    }

    #[must_use]
    pub fn chunk(channel: &str, reply_to: &str, data: Value) -> Self {
        Self {
            reply_to: Some(reply_to.to_string()),
            chunk: Some(true),
            data: Some(data),
            ..Self::empty(channel)
        }
    }

    #[must_use]
    pub fn reply(channel: &str, reply_to: &str, data: Value) -> Self {
        Self {
            reply_to: Some(reply_to.to_string()),
            data: Some(data),
            ..Self::empty(channel)
        }
    }

    #[must_use]
    pub fn reply_error(channel: &str, reply_to: &str, error: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.to_string()),
            error: Some(error.into()),
            ..Self::empty(channel)
        }
    }

    #[must_use]
    pub fn cancel(channel: &str, target: &str) -> Self {
        Self {
            control: Some(Control::Cancel),
            target: Some(target.to_string()),
            ..Self::empty(channel)
        }
    }

    #[must_use]
    pub fn is_chunk(&self) -> bool {
        self.chunk == Some(true)
    }

    #[must_use]
    pub fn is_cancel(&self) -> bool {
        self.control == Some(Control::Cancel)
    }

    /// Decode from JSON text.
    pub fn decode(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text).map_err(|err| BridgeError::Malformed(err.to_string()))
    }

    /// Encode to JSON text.
    pub fn encode(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|err| BridgeError::Malformed(err.to_string()))
    }
}

/// Random 128-bit correlation id, hex encoded.
#[must_use]
pub fn new_correlation_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

// =============================================================================
// Transport
// =============================================================================

/// Outbound half of a message port.
#[async_trait]
pub trait Port: Send + Sync + 'static {
    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError>;
}

/// Port backed by a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPort {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl Port for ChannelPort {
    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| BridgeError::Unavailable("peer disconnected".to_string()))
    }
}

/// One side of a connected pair: where to send, and what arrives.
pub struct PortEnd {
    pub port: Arc<dyn Port>,
    pub inbound: mpsc::Receiver<Envelope>,
}

/// Two linked in-process ends.
#[must_use]
pub fn in_memory_pair() -> (PortEnd, PortEnd) {
    let (a_tx, a_rx) = mpsc::channel(PORT_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(PORT_CAPACITY);
    (
        PortEnd {
            port: Arc::new(ChannelPort { tx: b_tx }),
            inbound: a_rx,
        },
        PortEnd {
            port: Arc::new(ChannelPort { tx: a_tx }),
            inbound: b_rx,
        },
    )
}

// =============================================================================
// Client
// =============================================================================

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline; the client's default when unset
    pub timeout: Option<Duration>,
    /// Receives the `data` of every chunk for this call
    pub on_chunk: Option<mpsc::UnboundedSender<Value>>,
    /// External cancellation
    pub signal: Option<CancelSignal>,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_chunks(mut self, tx: mpsc::UnboundedSender<Value>) -> Self {
        self.on_chunk = Some(tx);
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

struct PendingCall {
    reply: oneshot::Sender<Result<Value, BridgeError>>,
    on_chunk: Option<mpsc::UnboundedSender<Value>>,
}

struct ClientInner {
    port: Arc<dyn Port>,
    channel: String,
    default_timeout: Duration,
    slow_timeout: Duration,
    pending: Mutex<HashMap<String, PendingCall>>,
    closed: AtomicBool,
}

impl ClientInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn route(&self, envelope: Envelope) {
        if envelope.channel != self.channel {
            trace!(channel = %envelope.channel, "Ignoring envelope on foreign channel");
            return;
        }
        let Some(reply_to) = envelope.reply_to.as_deref() else {
            trace!("Ignoring envelope without replyTo");
            return;
        };

        if envelope.is_chunk() {
            let sender = self
                .pending()
                .get(reply_to)
                .and_then(|call| call.on_chunk.clone());
            match (sender, envelope.data) {
                (Some(tx), Some(data)) => {
                    let _ = tx.send(data);
                }
                (None, _) => {
                    debug!(correlation_id = reply_to, "Dropping chunk for settled call");
                }
                (Some(_), None) => {}
            }
            return;
        }

        let Some(call) = self.pending().remove(reply_to) else {
            debug!(correlation_id = reply_to, "Dropping late reply");
            return;
        };
        let outcome = match envelope.error {
            Some(message) => Err(BridgeError::Remote(message)),
            None => Ok(envelope.data.unwrap_or(Value::Null)),
        };
        let _ = call.reply.send(outcome);
    }

    fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PendingCall> = self.pending().drain().map(|(_, call)| call).collect();
        if !drained.is_empty() {
            warn!(calls = drained.len(), reason, "Failing pending bridge calls");
        }
        for call in drained {
            let _ = call
                .reply
                .send(Err(BridgeError::Unavailable(reason.to_string())));
        }
    }
}

/// Caller side of the bridge.
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
    demux: Arc<JoinHandle<()>>,
}

impl BridgeClient {
    /// Start a client over `end`, spawning its demux task.
    #[must_use]
    pub fn new(end: PortEnd, config: &BridgeConfig) -> Self {
        let inner = Arc::new(ClientInner {
            port: end.port,
            channel: config.channel.clone(),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            slow_timeout: Duration::from_millis(config.slow_timeout_ms),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let demux = tokio::spawn(demux(Arc::downgrade(&inner), end.inbound));
        Self {
            inner,
            demux: Arc::new(demux),
        }
    }

    /// Timeout for slow-class work such as whole delegated runs.
    #[must_use]
    pub fn slow_timeout(&self) -> Duration {
        self.inner.slow_timeout
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.demux.is_finished()
    }

    /// Send `payload` and await its single final reply.
    pub async fn call(
        &self,
        tab: Option<TabId>,
        payload: Value,
        options: CallOptions,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Unavailable("bridge closed".to_string()));
        }
        let inner = &self.inner;
        let id = new_correlation_id();
        let timeout = options.timeout.unwrap_or(inner.default_timeout);
        let signal = options.signal.unwrap_or_else(CancelSignal::never);
        let (reply_tx, reply_rx) = oneshot::channel();
        inner.pending().insert(
            id.clone(),
            PendingCall {
                reply: reply_tx,
                on_chunk: options.on_chunk,
            },
        );

        let request = Envelope::request(&inner.channel, id.clone(), tab, payload);
        if let Err(err) = inner.port.send(request).await {
            inner.pending().remove(&id);
            warn!(correlation_id = %id, error = %err, "Bridge send failed");
            return Err(match err {
                BridgeError::Unavailable(_) => err,
                other => BridgeError::Unavailable(other.to_string()),
            });
        }
        trace!(correlation_id = %id, timeout_ms = timeout.as_millis() as u64, "Bridge call sent");

        let outcome = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(BridgeError::Cancelled),
            reply = reply_rx => reply.unwrap_or_else(|_| {
                Err(BridgeError::Unavailable("bridge closed".to_string()))
            }),
            () = tokio::time::sleep(timeout) => Err(BridgeError::Timeout(timeout.as_millis() as u64)),
        };

        // Settled: later chunks and replies for this id are dropped.
        inner.pending().remove(&id);

        if matches!(outcome, Err(BridgeError::Cancelled | BridgeError::Timeout(_))) {
            debug!(correlation_id = %id, outcome = ?outcome, "Cancelling remote work");
            if let Err(err) = inner.port.send(Envelope::cancel(&inner.channel, &id)).await {
                debug!(correlation_id = %id, error = %err, "Cancel notification not delivered");
            }
        }
        outcome
    }

    /// Delegate a whole check run to the remote runner.
    ///
    /// Streamed results are forwarded to `on_result` as they arrive.
    pub async fn run_checks(
        &self,
        page: &Page,
        ctx: &CheckContext,
        signal: CancelSignal,
        on_result: Option<mpsc::UnboundedSender<CheckResult>>,
    ) -> Result<Vec<CheckResult>, BridgeError> {
        let request = RemoteRequest::Run {
            page: page.clone(),
            context: ctx.clone(),
        };
        let payload =
            serde_json::to_value(&request).map_err(|err| BridgeError::Malformed(err.to_string()))?;

        let mut options = CallOptions::default()
            .with_timeout(self.slow_timeout())
            .with_signal(signal);
        let forwarder = on_result.map(|results| {
            let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Value>();
            options.on_chunk = Some(chunk_tx);
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    match serde_json::from_value::<CheckResult>(chunk) {
                        Ok(result) => {
                            let _ = results.send(result);
                        }
                        Err(err) => debug!(error = %err, "Dropping undecodable chunk"),
                    }
                }
            })
        });

        let reply = self.call(ctx.tab_id, payload, options).await;
        if let Some(forwarder) = forwarder {
            // The pending entry is gone, so the chunk channel is closed.
            let _ = forwarder.await;
        }
        serde_json::from_value(reply?).map_err(|err| BridgeError::Malformed(err.to_string()))
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("channel", &self.inner.channel)
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn demux(inner: Weak<ClientInner>, mut inbound: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(envelope);
    }
    if let Some(inner) = inner.upgrade() {
        inner.fail_all("remote context disconnected");
    }
}

/// The single whole-run failure entry shown when the bridge fails.
///
/// `details` carries the error's remediation so the result panel can show
/// what to do next.
#[must_use]
pub fn runner_error_result(run_id: &RunId, err: &BridgeError) -> CheckResult {
    let message = match err {
        BridgeError::Unavailable(detail) => {
            format!("Check runner unavailable: {detail}")
        }
        BridgeError::Timeout(ms) => format!("Check runner timed out after {ms} ms"),
        other => format!("Check runner failed: {other}"),
    };
    let remediation = err.remediation();
    CheckResult::error("Check runner", message)
        .with_rule_id(RUNNER_RULE_ID)
        .with_run_id(run_id.clone())
        .with_priority(100)
        .with_details(serde_json::json!({
            "remediation": remediation.summary,
            "alternatives": remediation.alternatives,
        }))
}

// =============================================================================
// Remote side
// =============================================================================

/// Requests understood by the remote runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemoteRequest {
    Run { page: Page, context: CheckContext },
}

/// Streams each emitted result back as a chunk, until cancelled.
struct ChunkSink {
    port: Arc<dyn Port>,
    channel: String,
    reply_to: String,
    signal: CancelSignal,
}

#[async_trait]
impl ResultSink for ChunkSink {
    async fn emit(&self, result: CheckResult) {
        if self.signal.is_cancelled() {
            return;
        }
        let data = match serde_json::to_value(&result) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "Failed to encode chunk");
                return;
            }
        };
        if let Err(err) = self
            .port
            .send(Envelope::chunk(&self.channel, &self.reply_to, data))
            .await
        {
            debug!(correlation_id = %self.reply_to, error = %err, "Chunk not delivered");
        }
    }
}

/// Serves check runs inside the isolated context.
pub struct RemoteRunner {
    registry: Arc<RuleRegistry>,
    queue: RuleQueue,
    port: Arc<dyn Port>,
    channel: String,
    jobs: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

fn lock_jobs(
    jobs: &Mutex<HashMap<String, CancelHandle>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
    match jobs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RemoteRunner {
    #[must_use]
    pub fn new(registry: RuleRegistry, queue: RuleQueue, port: Arc<dyn Port>, channel: &str) -> Self {
        Self {
            registry: Arc::new(registry),
            queue,
            port,
            channel: channel.to_string(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of jobs still running.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        lock_jobs(&self.jobs).len()
    }

    /// Serve requests from `inbound` on a background task.
    pub fn spawn(self, inbound: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        tokio::spawn(self.serve(inbound))
    }

    /// Serve requests until the inbound stream closes.
    pub async fn serve(self, mut inbound: mpsc::Receiver<Envelope>) {
        info!(channel = %self.channel, rules = self.registry.len(), "Remote runner started");
        while let Some(envelope) = inbound.recv().await {
            if envelope.channel != self.channel {
                continue;
            }
            if envelope.is_cancel() {
                if let Some(target) = envelope.target.as_deref() {
                    self.cancel_job(target);
                }
                continue;
            }
            if let Some(id) = envelope.id.clone() {
                self.start_job(id, envelope.payload.unwrap_or(Value::Null))
                    .await;
            }
        }
        let jobs: Vec<CancelHandle> = lock_jobs(&self.jobs).drain().map(|(_, h)| h).collect();
        for handle in jobs {
            handle.cancel("port closed");
        }
        info!(channel = %self.channel, "Remote runner stopped");
    }

    fn cancel_job(&self, target: &str) {
        match lock_jobs(&self.jobs).remove(target) {
            Some(handle) => {
                handle.cancel("remote cancel");
                debug!(correlation_id = target, "Remote job cancelled");
            }
            None => trace!(correlation_id = target, "Cancel for unknown job"),
        }
    }

    async fn start_job(&self, id: String, payload: Value) {
        let request = match serde_json::from_value::<RemoteRequest>(payload) {
            Ok(request) => request,
            Err(err) => {
                let reply = Envelope::reply_error(
                    &self.channel,
                    &id,
                    format!("unsupported request: {err}"),
                );
                if let Err(err) = self.port.send(reply).await {
                    debug!(correlation_id = %id, error = %err, "Error reply not delivered");
                }
                return;
            }
        };
        let RemoteRequest::Run { page, context } = request;

        let handle = CancelHandle::new();
        let signal = handle.signal();
        lock_jobs(&self.jobs).insert(id.clone(), handle);

        let registry = Arc::clone(&self.registry);
        let queue = self.queue.clone();
        let port = Arc::clone(&self.port);
        let channel = self.channel.clone();
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let sink = Arc::new(ChunkSink {
                port: Arc::clone(&port),
                channel: channel.clone(),
                reply_to: id.clone(),
                signal: signal.clone(),
            });
            let outcome = queue
                .run_registry(
                    &registry,
                    Arc::new(page),
                    Arc::new(context),
                    signal.clone(),
                    sink,
                )
                .await;
            lock_jobs(&jobs).remove(&id);

            let reply = match outcome {
                _ if signal.is_cancelled() => None,
                Ok(results) => match serde_json::to_value(&results) {
                    Ok(data) => Some(Envelope::reply(&channel, &id, data)),
                    Err(err) => Some(Envelope::reply_error(&channel, &id, err.to_string())),
                },
                Err(err) if err.is_cancelled() => None,
                Err(err) => Some(Envelope::reply_error(&channel, &id, err.to_string())),
            };
            match reply {
                Some(reply) => {
                    if let Err(err) = port.send(reply).await {
                        debug!(correlation_id = %id, error = %err, "Reply not delivered");
                    }
                }
                None => debug!(correlation_id = %id, "Cancelled job emits nothing"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleError;
    use crate::model::ResultType;
    use crate::rules::Rule;
    use serde_json::json;

    struct Sleepy {
        id: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Rule for Sleepy {
        fn id(&self) -> &str {
            self.id
        }
        fn name(&self) -> &str {
            self.id
        }
        async fn run(
            &self,
            _page: &Page,
            _ctx: &CheckContext,
            _signal: CancelSignal,
        ) -> Result<CheckResult, RuleError> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(CheckResult::ok(self.id, "done"))
        }
    }

    fn registry() -> RuleRegistry {
        RuleRegistry::new()
            .with(Arc::new(Sleepy { id: "slow", delay_ms: 200 }))
            .with(Arc::new(Sleepy { id: "fast", delay_ms: 20 }))
    }

    fn connect() -> (BridgeClient, RemoteRunner, mpsc::Receiver<Envelope>) {
        let (local, remote) = in_memory_pair();
        let config = BridgeConfig::default();
        let client = BridgeClient::new(local, &config);
        let runner = RemoteRunner::new(registry(), RuleQueue::default(), remote.port, &config.channel);
        (client, runner, remote.inbound)
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let request = Envelope::request("pagecheck", "abc".into(), Some(TabId(7)), json!({"x": 1}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"channel": "pagecheck", "id": "abc", "tabId": 7, "payload": {"x": 1}}));

        let cancel = serde_json::to_value(Envelope::cancel("pagecheck", "abc")).unwrap();
        assert_eq!(cancel, json!({"channel": "pagecheck", "control": "cancel", "target": "abc"}));

        let chunk = Envelope::decode(r#"{"replyTo":"abc","chunk":true,"data":1}"#).unwrap();
        assert_eq!(chunk.channel, "pagecheck");
        assert!(chunk.is_chunk());
        assert!(Envelope::decode("{").is_err());
    }

    #[test]
    fn correlation_ids_are_128_bit_hex() {
        let a = new_correlation_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, new_correlation_id());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_run_streams_chunks_then_replies() {
        let (client, runner, inbound) = connect();
        let server = runner.spawn(inbound);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = CheckContext::for_run(TabId(1), RunId::from("run-1"));

        let results = client
            .run_checks(&Page::default(), &ctx, CancelSignal::never(), Some(tx))
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(CheckResult::identity).collect();
        assert_eq!(ids, vec!["slow", "fast"]);

        let mut streamed = Vec::new();
        while let Ok(result) = rx.try_recv() {
            streamed.push(result.rule_id.unwrap());
        }
        assert_eq!(streamed, vec!["fast", "slow"]);
        assert_eq!(client.pending_count(), 0);
        server.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_settles_once_and_sends_cancel() {
        let (local, mut remote) = in_memory_pair();
        let client = BridgeClient::new(local, &BridgeConfig::default());

        let err = client
            .call(
                None,
                json!({"action": "noop"}),
                CallOptions::default().with_timeout(Duration::from_millis(250)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout(250));
        assert_eq!(client.pending_count(), 0);

        let request = remote.inbound.recv().await.unwrap();
        let cancel = remote.inbound.recv().await.unwrap();
        assert!(cancel.is_cancel());
        assert_eq!(cancel.target, request.id);

        // A late reply is dropped without effect.
        let late = Envelope::reply("pagecheck", request.id.as_deref().unwrap(), json!(1));
        remote.port.send(late).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_stops_remote_job() {
        let (client, runner, inbound) = connect();
        let jobs = Arc::clone(&runner.jobs);
        let server = runner.spawn(inbound);
        let (handle, signal) = crate::cancel::cancel_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = CheckContext::for_run(TabId(1), RunId::from("run-1"));

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .run_checks(&Page::default(), &ctx, signal, Some(tx))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel("navigation");
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::Cancelled);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(lock_jobs(&jobs).is_empty());
        let mut streamed = Vec::new();
        while let Ok(result) = rx.try_recv() {
            streamed.push(result.rule_id.unwrap());
        }
        assert_eq!(streamed, vec!["fast"]);
        server.abort();
    }

    #[tokio::test]
    async fn remote_error_reply_surfaces() {
        let (client, runner, inbound) = connect();
        let server = runner.spawn(inbound);
        let err = client
            .call(None, json!({"action": "explode"}), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Remote(ref msg) if msg.starts_with("unsupported request")));
        server.abort();
    }

    #[tokio::test]
    async fn dropped_remote_fails_pending_calls() {
        let (local, remote) = in_memory_pair();
        let client = BridgeClient::new(local, &BridgeConfig::default());
        let PortEnd { port, mut inbound } = remote;

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call(None, json!({}), CallOptions::default()).await }
        });
        // Wait for the request, then disconnect the remote entirely.
        inbound.recv().await.unwrap();
        drop(port);
        drop(inbound);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
        let again = client.call(None, json!({}), CallOptions::default()).await;
        assert!(matches!(again, Err(BridgeError::Unavailable(_))));
    }

    #[test]
    fn runner_error_messages_distinguish_causes() {
        let run = RunId::from("run-1");
        let unavailable = runner_error_result(&run, &BridgeError::Unavailable("gone".into()));
        let timeout = runner_error_result(&run, &BridgeError::Timeout(120_000));
        let other = runner_error_result(&run, &BridgeError::Remote("bad".into()));

        assert!(unavailable.message.contains("unavailable"));
        assert!(timeout.message.contains("timed out"));
        assert!(other.message.contains("failed"));
        for result in [&unavailable, &timeout, &other] {
            assert!(result.is_runner_error());
            assert_eq!(result.kind, ResultType::Error);
            assert_eq!(result.run_id, Some(run.clone()));
            let details = result.details.as_ref().unwrap();
            assert!(!details["remediation"].as_str().unwrap().is_empty());
        }
        assert_eq!(
            unavailable.details.as_ref().unwrap()["remediation"],
            "Restart the isolated execution context."
        );
    }
}
