//! Transport layer abstraction for telemetry synchronization.
//!
//! Two transport kinds sit behind one adapter: pull transports perform a
//! single request/response per call, push transports open a persistent
//! stream and report lifecycle events through [`StreamEvents`]. Both report
//! failures as [`EngineError`] values and never panic on I/O errors.

use crate::clock::Clock;
use crate::config::{EndpointConfig, TransportKind};
use crate::error::{EngineError, EngineResult};
use crate::http::{HttpTransport, ReqwestClient};
use crate::ws::WebSocketTransport;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Future returned by transport calls.
pub type TransportFuture<T> = BoxFuture<'static, EngineResult<T>>;

/// A request/response transport. The caller decides the cadence.
pub trait PullTransport: Send + Sync + 'static {
    /// Performs one fetch and resolves to the raw response body.
    fn execute(&self) -> TransportFuture<Vec<u8>>;

    /// Releases transport resources. Idempotent; a later `execute` reopens.
    fn close(&self);
}

/// A persistent stream transport.
pub trait PushTransport: Send + Sync + 'static {
    /// Opens a stream. Resolution of the future is the open event; after
    /// that, inbound frames, errors and closure arrive through `events`.
    fn open(&self, events: StreamEvents) -> TransportFuture<Box<dyn StreamHandle>>;
}

/// An open stream.
pub trait StreamHandle: Send + Sync {
    /// Sends a text frame.
    fn send(&self, frame: String) -> EngineResult<()>;

    /// Closes the stream. Idempotent; no events are delivered afterwards.
    fn close(&self);

    /// Returns true until the stream is closed from either side.
    fn is_open(&self) -> bool;
}

/// Lifecycle event reported by an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An inbound text frame.
    Message(String),
    /// A transport error. The stream should be considered dead.
    Error(EngineError),
    /// The remote side closed the stream.
    Closed {
        /// Close reason, if the peer gave one.
        reason: Option<String>,
    },
}

/// Callback sink a push transport reports stream events to.
#[derive(Clone)]
pub struct StreamEvents {
    sink: Arc<dyn Fn(StreamEvent) + Send + Sync>,
}

impl StreamEvents {
    /// Creates a sink from a callback.
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Reports an inbound frame.
    pub fn message(&self, frame: impl Into<String>) {
        (self.sink)(StreamEvent::Message(frame.into()));
    }

    /// Reports a transport error.
    pub fn error(&self, error: EngineError) {
        (self.sink)(StreamEvent::Error(error));
    }

    /// Reports remote closure.
    pub fn closed(&self, reason: Option<String>) {
        (self.sink)(StreamEvent::Closed { reason });
    }
}

impl fmt::Debug for StreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamEvents")
    }
}

/// One of the two transport kinds.
#[derive(Clone)]
pub enum TransportAdapter {
    /// Periodic fetches.
    Pull(Arc<dyn PullTransport>),
    /// Persistent stream.
    Push(Arc<dyn PushTransport>),
}

impl TransportAdapter {
    /// Wraps a pull transport.
    pub fn pull(transport: impl PullTransport) -> Self {
        Self::Pull(Arc::new(transport))
    }

    /// Wraps a push transport.
    pub fn push(transport: impl PushTransport) -> Self {
        Self::Push(Arc::new(transport))
    }

    /// Builds the network transport an endpoint configuration asks for:
    /// HTTP GET for pull, WebSocket for push.
    pub fn for_endpoint(config: &EndpointConfig) -> EngineResult<Self> {
        match config.transport_kind {
            TransportKind::Pull => {
                let client = ReqwestClient::new()?;
                Ok(Self::pull(HttpTransport::new(config.endpoint.clone(), client)))
            }
            TransportKind::Push => Ok(Self::push(WebSocketTransport::new(
                config.endpoint.clone(),
            ))),
        }
    }

    /// Returns the transport kind.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportAdapter::Pull(_) => TransportKind::Pull,
            TransportAdapter::Push(_) => TransportKind::Push,
        }
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAdapter({})", self.kind())
    }
}

/// Scripted reply for [`MockPullTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Resolve immediately with a body.
    Body(Vec<u8>),
    /// Resolve after a delay (measured on the mock's clock) with a body.
    Delayed(Duration, Vec<u8>),
    /// Fail immediately with a transport error.
    Fail(String),
    /// Never resolve.
    Hang,
}

/// A scripted pull transport for testing.
///
/// Replies are consumed in order; once the script is empty the fallback
/// reply (if any) is repeated.
#[derive(Default)]
pub struct MockPullTransport {
    clock: Option<Arc<dyn Clock>>,
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Option<MockReply>>,
    calls: AtomicUsize,
    closes: AtomicUsize,
}

impl MockPullTransport {
    /// Creates a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock whose delayed replies wait on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Appends a reply to the script.
    pub fn push_reply(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Sets the reply used once the script is exhausted.
    pub fn set_fallback(&self, reply: MockReply) {
        *self.fallback.lock() = Some(reply);
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `close` calls so far.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Option<MockReply> {
        self.script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
    }
}

impl PullTransport for MockPullTransport {
    fn execute(&self) -> TransportFuture<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_reply() {
            Some(MockReply::Body(body)) => Box::pin(async move { Ok(body) }),
            Some(MockReply::Fail(message)) => {
                Box::pin(async move { Err(EngineError::transport(message)) })
            }
            Some(MockReply::Hang) => Box::pin(futures_util::future::pending()),
            Some(MockReply::Delayed(delay, body)) => match &self.clock {
                Some(clock) => {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let _timer = clock.after(
                        delay,
                        Box::new(move || {
                            let _ = tx.send(());
                        }),
                    );
                    Box::pin(async move {
                        rx.await
                            .map_err(|_| EngineError::transport("mock clock dropped"))?;
                        Ok(body)
                    })
                }
                None => Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(body)
                }),
            },
            None => Box::pin(async { Err(EngineError::transport("no mock reply set")) }),
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted outcome of [`MockPushTransport::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOpen {
    /// Open a [`MockStream`].
    Accept,
    /// Fail with a transport error.
    Refuse(String),
    /// Never resolve.
    Hang,
}

/// A scripted push transport for testing.
///
/// Accepted streams are kept so tests can play the remote side.
#[derive(Default)]
pub struct MockPushTransport {
    script: Mutex<VecDeque<MockOpen>>,
    streams: Mutex<Vec<MockStream>>,
    attempts: AtomicUsize,
}

impl MockPushTransport {
    /// Creates a mock that accepts every open unless scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an open outcome to the script.
    pub fn push_open(&self, outcome: MockOpen) {
        self.script.lock().push_back(outcome);
    }

    /// Number of `open` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The most recently accepted stream.
    pub fn last_stream(&self) -> Option<MockStream> {
        self.streams.lock().last().cloned()
    }

    /// Number of accepted streams.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }
}

impl PushTransport for MockPushTransport {
    fn open(&self, events: StreamEvents) -> TransportFuture<Box<dyn StreamHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(MockOpen::Accept);
        match outcome {
            MockOpen::Accept => {
                let stream = MockStream::new(events);
                self.streams.lock().push(stream.clone());
                Box::pin(async move { Ok(Box::new(stream) as Box<dyn StreamHandle>) })
            }
            MockOpen::Refuse(message) => {
                Box::pin(async move { Err(EngineError::transport(message)) })
            }
            MockOpen::Hang => Box::pin(futures_util::future::pending()),
        }
    }
}

struct MockStreamInner {
    events: StreamEvents,
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
    closes: AtomicUsize,
}

/// Both ends of a mock stream: the engine's handle and the test's remote.
#[derive(Clone)]
pub struct MockStream {
    inner: Arc<MockStreamInner>,
}

impl MockStream {
    fn new(events: StreamEvents) -> Self {
        Self {
            inner: Arc::new(MockStreamInner {
                events,
                sent: Mutex::new(Vec::new()),
                open: AtomicBool::new(true),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Delivers an inbound frame, as if sent by the remote side.
    pub fn deliver(&self, frame: impl Into<String>) {
        if self.is_open() {
            self.inner.events.message(frame);
        }
    }

    /// Fails the stream with a transport error.
    pub fn fail(&self, message: &str) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            self.inner.events.error(EngineError::transport(message));
        }
    }

    /// Closes the stream from the remote side.
    pub fn close_remotely(&self, reason: Option<&str>) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            self.inner.events.closed(reason.map(str::to_string));
        }
    }

    /// Frames the engine sent.
    pub fn sent(&self) -> Vec<String> {
        self.inner.sent.lock().clone()
    }

    /// Number of local `close` calls.
    pub fn local_closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

impl StreamHandle for MockStream {
    fn send(&self, frame: String) -> EngineResult<()> {
        if !self.is_open() {
            return Err(EngineError::NotConnected);
        }
        self.inner.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }
}
