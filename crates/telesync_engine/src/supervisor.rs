//! Connection supervisor state machine.
//!
//! The supervisor owns all connection state and is driven by a single task
//! that feeds it [`Event`]s one at a time. Timers and transport I/O never
//! touch supervisor state directly: they post an event tagged with the
//! operation id, connection id or timer epoch they belong to, and events for
//! anything that has since been cancelled or superseded are ignored.
//!
//! ```text
//! Disconnected --start--> Connecting --success--> Connected
//!                              |                      |
//!                           failure            failure / silence
//!                              v                      v
//!                  Failed <-- Recovering <------------+
//!                (max attempts)   |
//!                                 +--retry timer--> Connecting
//! ```

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::clock::{Clock, TimerHandle};
use crate::config::EndpointConfig;
use crate::dedup::DedupWindow;
use crate::dispatcher::{Dispatcher, ErrorChannel, Update};
use crate::error::{EngineError, EngineResult};
use crate::guard::{OperationId, RequestGuard, StaleOperation};
use crate::scheduler::{AdaptiveScheduler, Sample, SchedulerConfig};
use crate::state::{ConnectionState, EngineStats};
use crate::transport::{StreamEvent, StreamEvents, StreamHandle, TransportAdapter};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telesync_protocol::{Envelope, Snapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Input to the supervisor.
pub(crate) enum Event {
    Start,
    Stop,
    Reset,
    Shutdown,
    Local(Update),
    AttemptDue {
        epoch: u64,
    },
    OperationTimeout {
        op: OperationId,
    },
    GuardExpired {
        op: OperationId,
    },
    KeepaliveTick {
        connection: u64,
    },
    PullFinished {
        op: OperationId,
        result: EngineResult<Vec<u8>>,
    },
    StreamOpened {
        op: OperationId,
        result: EngineResult<Box<dyn StreamHandle>>,
    },
    Stream {
        connection: u64,
        event: StreamEvent,
    },
}

/// State shared between the supervisor task and engine handles.
pub(crate) struct Shared {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) errors: ErrorChannel,
    pub(crate) stats: RwLock<EngineStats>,
    pub(crate) state: watch::Sender<ConnectionState>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            dispatcher: Dispatcher::new(),
            errors: ErrorChannel::new(),
            stats: RwLock::new(EngineStats::default()),
            state,
        }
    }
}

/// Why the next attempt timer was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Retry,
    Poll,
}

struct ScheduledAttempt {
    epoch: u64,
    kind: AttemptKind,
    timer: TimerHandle,
}

struct InFlight {
    op: OperationId,
    task: AbortHandle,
    timeout: TimerHandle,
    /// Stream id for an open in progress.
    connection: Option<u64>,
    /// Stream events that raced ahead of the open completion.
    early: Vec<StreamEvent>,
}

impl InFlight {
    fn abort(self) {
        self.task.abort();
        self.timeout.cancel();
    }
}

struct ActiveStream {
    connection: u64,
    handle: Box<dyn StreamHandle>,
    last_inbound: Instant,
    keepalive: Option<TimerHandle>,
}

/// Drives one endpoint connection through its lifecycle.
pub(crate) struct Supervisor {
    config: EndpointConfig,
    clock: Arc<dyn Clock>,
    adapter: TransportAdapter,
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    state: ConnectionState,
    policy: BackoffPolicy,
    backoff: BackoffState,
    guard: RequestGuard,
    scheduler: AdaptiveScheduler,
    dedup: DedupWindow,
    epoch: u64,
    next_attempt: Option<ScheduledAttempt>,
    in_flight: Option<InFlight>,
    stream: Option<ActiveStream>,
    next_connection: u64,
}

impl Supervisor {
    pub(crate) fn new(
        config: EndpointConfig,
        adapter: TransportAdapter,
        clock: Arc<dyn Clock>,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            policy: BackoffPolicy::new(config.base_backoff, config.max_backoff),
            backoff: BackoffState::new(),
            guard: RequestGuard::new(Arc::clone(&clock), config.guard_safety_timeout),
            scheduler: AdaptiveScheduler::new(SchedulerConfig::from(&config)),
            dedup: DedupWindow::new(config.dedup_window),
            state: ConnectionState::Disconnected,
            epoch: 0,
            next_attempt: None,
            in_flight: None,
            stream: None,
            next_connection: 1,
            config,
            clock,
            adapter,
            events,
            shared,
        }
    }

    /// Applies one event.
    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Start => self.start(),
            Event::Stop | Event::Shutdown => self.stop(),
            Event::Reset => self.reset(),
            Event::Local(update) => self.deliver(update),
            Event::AttemptDue { epoch } => self.on_attempt_due(epoch),
            Event::OperationTimeout { op } => self.on_operation_timeout(op),
            Event::GuardExpired { op } => self.on_guard_expired(op),
            Event::KeepaliveTick { connection } => self.on_keepalive(connection),
            Event::PullFinished { op, result } => self.on_pull_finished(op, result),
            Event::StreamOpened { op, result } => self.on_stream_opened(op, result),
            Event::Stream { connection, event } => self.on_stream_event(connection, event),
        }
    }

    fn start(&mut self) {
        if !self.state.can_start() {
            debug!(state = %self.state, "start ignored");
            return;
        }
        info!(endpoint = %self.config.endpoint, transport = %self.adapter.kind(), "starting");
        self.set_state(ConnectionState::Connecting);
        self.attempt();
    }

    fn stop(&mut self) {
        if self.state.is_terminal() {
            debug!("stop ignored in failed state; reset is required");
            return;
        }
        self.teardown();
        self.backoff.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    fn reset(&mut self) {
        self.teardown();
        self.backoff.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Cancels every timer, drops the in-flight operation without running
    /// its completion, and closes the transport.
    fn teardown(&mut self) {
        self.cancel_next_attempt();
        if let Some(flight) = self.in_flight.take() {
            debug!(op = %flight.op, "dropping in-flight operation");
            flight.abort();
        }
        self.guard.clear();
        self.drop_stream();
        if let TransportAdapter::Pull(transport) = &self.adapter {
            transport.close();
        }
    }

    fn attempt(&mut self) {
        let tx = self.events.clone();
        let acquired = match self.guard.try_acquire(move |op| {
            let _ = tx.send(Event::GuardExpired { op });
        }) {
            Ok(acquired) => acquired,
            Err(refused) => {
                debug!(holder = %refused.holder, held_ms = refused.held_for.as_millis() as u64, "attempt refused; operation in flight");
                return;
            }
        };
        if let Some(stale) = acquired.replaced {
            if let Some(flight) = self.in_flight.take() {
                flight.abort();
            }
            self.report_guard_timeout(stale);
        }

        let op = acquired.id;
        let tx = self.events.clone();
        let timeout = self.clock.after(
            self.config.operation_timeout,
            Box::new(move || {
                let _ = tx.send(Event::OperationTimeout { op });
            }),
        );

        let tx = self.events.clone();
        let (task, connection) = match &self.adapter {
            TransportAdapter::Pull(transport) => {
                let fetch = transport.execute();
                let task = tokio::spawn(async move {
                    let result = fetch.await;
                    let _ = tx.send(Event::PullFinished { op, result });
                });
                (task.abort_handle(), None)
            }
            TransportAdapter::Push(transport) => {
                let connection = self.next_connection;
                self.next_connection += 1;
                let sink = self.events.clone();
                let events = StreamEvents::new(move |event| {
                    let _ = sink.send(Event::Stream { connection, event });
                });
                let open = transport.open(events);
                let task = tokio::spawn(async move {
                    let result = open.await;
                    let _ = tx.send(Event::StreamOpened { op, result });
                });
                (task.abort_handle(), Some(connection))
            }
        };

        debug!(%op, state = %self.state, failures = self.backoff.failures(), "attempt started");
        self.in_flight = Some(InFlight {
            op,
            task,
            timeout,
            connection,
            early: Vec::new(),
        });
    }

    /// Takes the in-flight operation if `op` is still current and releases
    /// the guard. Returns the operation and its latency.
    fn complete(&mut self, op: OperationId) -> Option<(InFlight, Duration)> {
        match &self.in_flight {
            Some(flight) if flight.op == op => {}
            _ => {
                trace!(%op, "ignoring completion of superseded operation");
                return None;
            }
        }
        let flight = self.in_flight.take()?;
        flight.timeout.cancel();
        let latency = self.guard.release(op).unwrap_or_default();
        Some((flight, latency))
    }

    fn on_pull_finished(&mut self, op: OperationId, result: EngineResult<Vec<u8>>) {
        let Some((_, latency)) = self.complete(op) else {
            return;
        };
        let snapshot = result.and_then(|body| Snapshot::decode(&body).map_err(EngineError::from));
        match snapshot {
            Ok(snapshot) => {
                let failures = self.succeed(latency);
                for (topic, data) in snapshot.into_facets() {
                    self.deliver(Update::from_facet(topic, data));
                }
                let delay = self.scheduler.next_delay(failures);
                debug!(
                    %op,
                    latency_ms = latency.as_millis() as u64,
                    band = ?self.scheduler.band(failures),
                    delay_ms = delay.as_millis() as u64,
                    "poll scheduled"
                );
                self.schedule_attempt(AttemptKind::Poll, delay);
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_stream_opened(&mut self, op: OperationId, result: EngineResult<Box<dyn StreamHandle>>) {
        let Some((flight, latency)) = self.complete(op) else {
            if let Ok(handle) = result {
                handle.close();
            }
            return;
        };
        match result {
            Ok(handle) => {
                let Some(connection) = flight.connection else {
                    handle.close();
                    return;
                };
                self.succeed(latency);
                self.stream = Some(ActiveStream {
                    connection,
                    handle,
                    last_inbound: self.clock.now(),
                    keepalive: None,
                });
                self.schedule_keepalive(connection);
                for event in flight.early {
                    self.on_stream_event(connection, event);
                }
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_stream_event(&mut self, connection: u64, event: StreamEvent) {
        if let Some(flight) = &mut self.in_flight {
            if flight.connection == Some(connection) {
                flight.early.push(event);
                return;
            }
        }
        let now = self.clock.now();
        let Some(stream) = self.stream.as_mut().filter(|s| s.connection == connection) else {
            trace!(connection, "ignoring event from closed stream");
            return;
        };

        match event {
            StreamEvent::Message(text) => {
                stream.last_inbound = now;
                match Envelope::decode(&text) {
                    Ok(envelope) if envelope.is_pong() => trace!(connection, "pong"),
                    Ok(envelope) if envelope.is_ping() => {
                        let reply = Envelope::pong().encode().map_err(EngineError::from);
                        if let Err(error) = reply.and_then(|frame| stream.handle.send(frame)) {
                            self.fail_stream(error);
                        }
                    }
                    Ok(envelope) => self.deliver(Update::from_envelope(envelope)),
                    Err(error) => self.fail_stream(error.into()),
                }
            }
            StreamEvent::Error(error) => self.fail_stream(error),
            StreamEvent::Closed { reason } => {
                let message = match reason {
                    Some(reason) if !reason.is_empty() => format!("stream closed: {reason}"),
                    _ => "stream closed".to_string(),
                };
                self.fail_stream(EngineError::transport(message));
            }
        }
    }

    fn on_keepalive(&mut self, connection: u64) {
        let now = self.clock.now();
        let silence_timeout = self.config.silence_timeout();
        let Some(stream) = self.stream.as_ref().filter(|s| s.connection == connection) else {
            return;
        };

        let silent_for = now.saturating_duration_since(stream.last_inbound);
        if silent_for >= silence_timeout {
            warn!(connection, silent_ms = silent_for.as_millis() as u64, "stream went silent");
            self.fail_stream(EngineError::transport(format!(
                "no inbound traffic for {silent_for:?}"
            )));
            return;
        }

        let ping = Envelope::ping().encode().map_err(EngineError::from);
        match ping.and_then(|frame| stream.handle.send(frame)) {
            Ok(()) => {
                trace!(connection, "ping sent");
                self.schedule_keepalive(connection);
            }
            Err(error) => self.fail_stream(error),
        }
    }

    fn on_attempt_due(&mut self, epoch: u64) {
        let kind = match &self.next_attempt {
            Some(next) if next.epoch == epoch => next.kind,
            _ => {
                trace!(epoch, "ignoring superseded attempt timer");
                return;
            }
        };
        self.next_attempt = None;
        match kind {
            AttemptKind::Retry => {
                if self.state != ConnectionState::Recovering {
                    return;
                }
                self.shared.stats.write().reconnect_attempts += 1;
                self.set_state(ConnectionState::Connecting);
            }
            AttemptKind::Poll => {
                if !self.state.is_active() {
                    return;
                }
            }
        }
        self.attempt();
    }

    fn on_operation_timeout(&mut self, op: OperationId) {
        let Some((flight, _)) = self.complete(op) else {
            return;
        };
        flight.task.abort();
        self.fail(EngineError::Timeout {
            after: self.config.operation_timeout,
        });
    }

    fn on_guard_expired(&mut self, op: OperationId) {
        let Some(stale) = self.guard.expire(op) else {
            return;
        };
        if let Some(flight) = self.in_flight.take() {
            flight.abort();
        }
        self.report_guard_timeout(stale);
        if self.state.is_active() && self.next_attempt.is_none() && self.stream.is_none() {
            let delay = self.scheduler.next_delay(self.backoff.failures());
            self.schedule_attempt(AttemptKind::Poll, delay);
        }
    }

    /// Records a success and returns the failure count that preceded it.
    fn succeed(&mut self, latency: Duration) -> u32 {
        let failures = self.backoff.failures();
        self.backoff.reset();
        let now = self.clock.now();
        self.scheduler.record(Sample {
            latency,
            completed_at: now,
        });
        {
            let mut stats = self.shared.stats.write();
            stats.syncs_completed += 1;
            stats.last_latency = Some(latency);
            stats.average_latency = self.scheduler.average_latency();
            stats.last_success = Some(now);
        }
        self.set_state(ConnectionState::Connected);
        failures
    }

    fn fail_stream(&mut self, error: EngineError) {
        self.drop_stream();
        self.fail(error);
    }

    /// Handles a recoverable failure: backs off, or gives up once the attempt
    /// ceiling is reached.
    fn fail(&mut self, error: EngineError) {
        if !self.state.is_active() {
            return;
        }
        self.shared.stats.write().failures += 1;
        self.surface(&error);

        if self.backoff.failures() >= self.config.max_reconnect_attempts {
            self.give_up();
            return;
        }

        let delay = self.backoff.record_failure(&self.policy);
        self.set_state(ConnectionState::Recovering);
        info!(
            attempt = self.backoff.failures(),
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.schedule_attempt(AttemptKind::Retry, delay);
    }

    fn give_up(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Failed);
        self.surface(&EngineError::MaxAttemptsExceeded {
            attempts: self.config.max_reconnect_attempts,
        });
    }

    fn report_guard_timeout(&mut self, stale: StaleOperation) {
        self.shared.stats.write().guard_timeouts += 1;
        warn!(op = %stale.id, held_ms = stale.held_for.as_millis() as u64, "guard released stale operation");
        self.surface(&EngineError::GuardTimeout {
            held_for: stale.held_for,
        });
    }

    fn surface(&self, error: &EngineError) {
        warn!(%error, kind = ?error.kind(), state = %self.state, "sync error");
        self.shared.stats.write().last_error = Some(error.to_string());
        self.shared.errors.emit(error);
    }

    fn deliver(&mut self, update: Update) {
        if let Some(key) = &update.key {
            if !self.dedup.admit(&update.topic, key) {
                debug!(topic = %update.topic, key = %key, "duplicate update dropped");
                self.shared.stats.write().duplicates_dropped += 1;
                return;
            }
        }
        let report = self.shared.dispatcher.publish(&update);
        trace!(topic = %update.topic, delivered = report.delivered, panicked = report.panicked, "update dispatched");
        self.shared.stats.write().messages_dispatched += 1;
    }

    fn schedule_attempt(&mut self, kind: AttemptKind, delay: Duration) {
        self.cancel_next_attempt();
        self.epoch += 1;
        let epoch = self.epoch;
        let tx = self.events.clone();
        let timer = self.clock.after(
            delay,
            Box::new(move || {
                let _ = tx.send(Event::AttemptDue { epoch });
            }),
        );
        self.next_attempt = Some(ScheduledAttempt { epoch, kind, timer });
    }

    fn cancel_next_attempt(&mut self) {
        if let Some(next) = self.next_attempt.take() {
            next.timer.cancel();
        }
    }

    fn schedule_keepalive(&mut self, connection: u64) {
        let tx = self.events.clone();
        let timer = self.clock.after(
            self.config.keepalive,
            Box::new(move || {
                let _ = tx.send(Event::KeepaliveTick { connection });
            }),
        );
        if let Some(stream) = self.stream.as_mut().filter(|s| s.connection == connection) {
            if let Some(previous) = stream.keepalive.replace(timer) {
                previous.cancel();
            }
        } else {
            timer.cancel();
        }
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Some(keepalive) = stream.keepalive {
                keepalive.cancel();
            }
            stream.handle.close();
            debug!(connection = stream.connection, "stream closed");
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "state changed");
        self.state = next;
        self.shared.state.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatcher::TopicFilter;
    use crate::error::ErrorKind;
    use crate::transport::{
        MockOpen, MockPullTransport, MockPushTransport, MockReply,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use telesync_protocol::Topic;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Harness {
        clock: Arc<ManualClock>,
        shared: Arc<Shared>,
        supervisor: Supervisor,
        rx: mpsc::UnboundedReceiver<Event>,
        errors: Arc<Mutex<Vec<EngineError>>>,
        updates: Arc<Mutex<Vec<Update>>>,
    }

    impl Harness {
        fn new(config: EndpointConfig, adapter: TransportAdapter, clock: Arc<ManualClock>) -> Self {
            let shared = Arc::new(Shared::new());
            let (tx, rx) = mpsc::unbounded_channel();
            let supervisor = Supervisor::new(config, adapter, clock.clone(), Arc::clone(&shared), tx);

            let errors = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&errors);
            let _errors = shared.errors.subscribe(move |e: &EngineError| sink.lock().push(e.clone()));
            let updates = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&updates);
            let _updates = shared
                .dispatcher
                .subscribe(TopicFilter::All, move |u: &Update| sink.lock().push(u.clone()));

            Self {
                clock,
                shared,
                supervisor,
                rx,
                errors,
                updates,
            }
        }

        fn pull(config: EndpointConfig) -> (Self, Arc<MockPullTransport>) {
            let clock = Arc::new(ManualClock::new());
            let transport = Arc::new(MockPullTransport::with_clock(clock.clone()));
            let adapter = TransportAdapter::Pull(transport.clone());
            (Self::new(config, adapter, clock), transport)
        }

        fn push(config: EndpointConfig) -> (Self, Arc<MockPushTransport>) {
            let clock = Arc::new(ManualClock::new());
            let transport = Arc::new(MockPushTransport::new());
            let adapter = TransportAdapter::Push(transport.clone());
            (Self::new(config, adapter, clock), transport)
        }

        async fn settle(&mut self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
                while let Ok(event) = self.rx.try_recv() {
                    self.supervisor.handle(event);
                }
            }
        }

        async fn send(&mut self, event: Event) {
            self.supervisor.handle(event);
            self.settle().await;
        }

        async fn advance(&mut self, by: Duration) {
            self.clock.advance(by);
            self.settle().await;
        }

        fn state(&self) -> ConnectionState {
            self.supervisor.state
        }

        fn error_kinds(&self) -> Vec<ErrorKind> {
            self.errors.lock().iter().map(EngineError::kind).collect()
        }
    }

    fn snapshot_body(cpu: f64) -> Vec<u8> {
        Snapshot::new()
            .with_metrics(json!({ "cpu": cpu }))
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn pull_success_connects_and_polls_on_fast_band() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        transport.push_reply(MockReply::Delayed(ms(150), snapshot_body(10.0)));
        transport.set_fallback(MockReply::Delayed(ms(900), snapshot_body(20.0)));

        h.send(Event::Start).await;
        assert_eq!(h.state(), ConnectionState::Connecting);

        h.advance(ms(150)).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.updates.lock().len(), 1);
        assert_eq!(h.clock.next_deadline(), Some(ms(1000)));

        h.advance(ms(1000)).await;
        assert_eq!(transport.calls(), 2);
        h.advance(ms(900)).await;
        assert_eq!(h.updates.lock().len(), 2);
        // 900 ms lands in the slow band.
        assert_eq!(h.clock.next_deadline(), Some(ms(5000)));
        assert_eq!(h.shared.stats.read().syncs_completed, 2);
    }

    #[tokio::test]
    async fn backoff_sequence_then_failed() {
        let config = EndpointConfig::pull("http://x/telemetry")
            .with_backoff(ms(1000), ms(30_000))
            .with_max_reconnect_attempts(5);
        let (mut h, transport) = Harness::pull(config);
        transport.set_fallback(MockReply::Fail("connection refused".into()));

        h.send(Event::Start).await;
        let mut delays = Vec::new();
        while h.state() == ConnectionState::Recovering {
            let delay = h.clock.next_deadline().unwrap();
            delays.push(delay);
            h.advance(delay).await;
        }

        assert_eq!(delays, vec![ms(1000), ms(2000), ms(4000), ms(8000), ms(16_000)]);
        assert_eq!(h.state(), ConnectionState::Failed);
        assert_eq!(transport.calls(), 6);
        assert_eq!(h.error_kinds().last(), Some(&ErrorKind::MaxAttemptsExceeded));
        assert_eq!(
            h.error_kinds()
                .iter()
                .filter(|k| **k == ErrorKind::MaxAttemptsExceeded)
                .count(),
            1
        );

        // Terminal: no more attempts and start is ignored.
        assert_eq!(h.clock.pending_timers(), 0);
        h.advance(ms(120_000)).await;
        h.send(Event::Start).await;
        h.send(Event::Stop).await;
        assert_eq!(h.state(), ConnectionState::Failed);
        assert_eq!(transport.calls(), 6);

        h.send(Event::Reset).await;
        assert_eq!(h.state(), ConnectionState::Disconnected);
        transport.push_reply(MockReply::Body(snapshot_body(1.0)));
        h.send(Event::Start).await;
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        transport.push_reply(MockReply::Fail("refused".into()));
        transport.push_reply(MockReply::Fail("refused".into()));
        transport.push_reply(MockReply::Body(snapshot_body(1.0)));
        transport.push_reply(MockReply::Fail("refused".into()));

        h.send(Event::Start).await;
        h.advance(ms(1000)).await;
        h.advance(ms(2000)).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.supervisor.backoff.failures(), 0);

        let poll = h.clock.next_deadline().unwrap();
        h.advance(poll).await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.clock.next_deadline(), Some(ms(1000)));
    }

    #[tokio::test]
    async fn degraded_interval_after_many_failures() {
        let config = EndpointConfig::pull("http://x/telemetry").with_max_reconnect_attempts(10);
        let (mut h, transport) = Harness::pull(config);
        for _ in 0..4 {
            transport.push_reply(MockReply::Fail("refused".into()));
        }
        transport.set_fallback(MockReply::Body(snapshot_body(1.0)));

        h.send(Event::Start).await;
        while h.state() == ConnectionState::Recovering {
            h.clock.advance_to_next();
            h.settle().await;
        }
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.clock.next_deadline(), Some(ms(15_000)));

        h.advance(ms(15_000)).await;
        assert_eq!(h.clock.next_deadline(), Some(ms(1000)));
    }

    #[tokio::test]
    async fn operation_timeout_feeds_backoff() {
        let config = EndpointConfig::pull("http://x/telemetry").with_operation_timeout(ms(500));
        let (mut h, transport) = Harness::pull(config);
        transport.push_reply(MockReply::Hang);

        h.send(Event::Start).await;
        h.advance(ms(500)).await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.error_kinds(), vec![ErrorKind::Timeout]);
        assert_eq!(h.clock.next_deadline(), Some(ms(1000)));
    }

    #[tokio::test]
    async fn guard_safety_timeout_releases_stuck_operation() {
        let config = EndpointConfig::pull("http://x/telemetry")
            .with_operation_timeout(ms(60_000))
            .with_guard_safety_timeout(ms(5000));
        let (mut h, transport) = Harness::pull(config);
        transport.push_reply(MockReply::Hang);
        transport.set_fallback(MockReply::Body(snapshot_body(1.0)));

        h.send(Event::Start).await;
        h.advance(ms(5000)).await;
        assert_eq!(h.error_kinds(), vec![ErrorKind::GuardTimeout]);
        // State is untouched; the next poll is scheduled.
        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(h.shared.stats.read().guard_timeouts, 1);

        let next = h.clock.next_deadline().unwrap();
        h.advance(next).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn stop_cancels_everything() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        transport.push_reply(MockReply::Delayed(ms(300), snapshot_body(1.0)));

        h.send(Event::Start).await;
        h.send(Event::Stop).await;
        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert_eq!(transport.closes(), 1);

        h.advance(ms(60_000)).await;
        assert!(h.updates.lock().is_empty());
        assert!(h.errors.lock().is_empty());
        assert_eq!(h.clock.pending_timers(), 0);

        h.send(Event::Stop).await;
        assert_eq!(transport.closes(), 2);
    }

    #[tokio::test]
    async fn malformed_snapshot_is_parse_error() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        transport.push_reply(MockReply::Body(b"not json".to_vec()));

        h.send(Event::Start).await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.error_kinds(), vec![ErrorKind::Parse]);
    }

    #[tokio::test]
    async fn push_stream_dispatches_and_consumes_pong() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));

        h.send(Event::Start).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        let stream = transport.last_stream().unwrap();

        stream.deliver(r#"{"type":"metrics","data":{"cpu":3}}"#);
        stream.deliver(r#"{"type":"pong"}"#);
        h.settle().await;

        let updates = h.updates.lock().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].topic, Topic::Metrics);
    }

    #[tokio::test]
    async fn keepalive_pings_and_detects_silence() {
        let config = EndpointConfig::push("ws://x/stream").with_keepalive(ms(1000));
        let (mut h, transport) = Harness::push(config);

        h.send(Event::Start).await;
        let stream = transport.last_stream().unwrap();

        h.advance(ms(1000)).await;
        assert_eq!(stream.sent(), vec![r#"{"type":"ping","data":null}"#.to_string()]);
        stream.deliver(r#"{"type":"pong"}"#);
        h.settle().await;

        // Silence timeout defaults to twice the keepalive; the pong at 1s
        // keeps the stream alive until 3s.
        h.advance(ms(1000)).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        h.advance(ms(1000)).await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.error_kinds(), vec![ErrorKind::Transport]);
        assert_eq!(stream.local_closes(), 1);

        h.advance(ms(1000)).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(transport.stream_count(), 2);
    }

    #[tokio::test]
    async fn remote_close_triggers_recovery() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));
        transport.push_open(MockOpen::Refuse("dns failure".into()));

        h.send(Event::Start).await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        h.advance(ms(1000)).await;
        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.shared.stats.read().reconnect_attempts, 1);

        transport.last_stream().unwrap().close_remotely(Some("going away"));
        h.settle().await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.clock.next_deadline(), Some(ms(1000)));
    }

    #[tokio::test]
    async fn stale_stream_events_are_ignored() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));
        h.send(Event::Start).await;
        let first = transport.last_stream().unwrap();

        first.fail("reset by peer");
        h.settle().await;
        h.advance(ms(1000)).await;
        assert_eq!(transport.stream_count(), 2);

        // The first stream is closed; anything it says is dropped.
        first.deliver(r#"{"type":"metrics","data":{}}"#);
        h.settle().await;
        assert!(h.updates.lock().is_empty());
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn malformed_frame_is_parse_error() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));
        h.send(Event::Start).await;

        transport.last_stream().unwrap().deliver("{not json");
        h.settle().await;
        assert_eq!(h.state(), ConnectionState::Recovering);
        assert_eq!(h.error_kinds(), vec![ErrorKind::Parse]);
    }

    #[tokio::test]
    async fn duplicates_across_paths_are_dropped() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));
        h.send(Event::Start).await;

        let local = Update::new(Topic::Events, json!({ "id": "attack-1" })).with_key("attack-1");
        h.send(Event::Local(local)).await;
        transport
            .last_stream()
            .unwrap()
            .deliver(r#"{"type":"events","id":"attack-1","data":{"id":"attack-1"}}"#);
        h.settle().await;

        assert_eq!(h.updates.lock().len(), 1);
        assert_eq!(h.shared.stats.read().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn repeated_snapshots_for_one_entity_are_delivered() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        let body = |cpu: u32| {
            Snapshot::new()
                .with_metrics(json!({ "id": "host-1", "cpu": cpu }))
                .encode()
                .unwrap()
        };
        transport.push_reply(MockReply::Body(body(10)));
        transport.set_fallback(MockReply::Body(body(99)));

        h.send(Event::Start).await;
        for _ in 0..3 {
            h.advance(ms(1000)).await;
        }

        let cpu: Vec<_> = h.updates.lock().iter().map(|u| u.data["cpu"].clone()).collect();
        assert_eq!(transport.calls(), 4);
        assert_eq!(cpu, vec![json!(10), json!(99), json!(99), json!(99)]);
        assert_eq!(h.shared.stats.read().duplicates_dropped, 0);
    }

    #[tokio::test]
    async fn repeated_stream_state_is_delivered_but_explicit_ids_are_not() {
        let (mut h, transport) = Harness::push(EndpointConfig::push("ws://x/stream"));
        h.send(Event::Start).await;
        let stream = transport.last_stream().unwrap();

        stream.deliver(r#"{"type":"metrics","data":{"id":"sensor-1","temp":20}}"#);
        stream.deliver(r#"{"type":"metrics","data":{"id":"sensor-1","temp":21}}"#);
        stream.deliver(r#"{"type":"events","id":"evt-9","data":{"kind":"attack"}}"#);
        stream.deliver(r#"{"type":"events","id":"evt-9","data":{"kind":"attack"}}"#);
        h.settle().await;

        let updates = h.updates.lock();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].data["temp"], json!(20));
        assert_eq!(updates[1].data["temp"], json!(21));
        assert_eq!(updates[2].key.as_deref(), Some("evt-9"));
        assert_eq!(h.shared.stats.read().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn state_changes_are_published() {
        let (mut h, transport) = Harness::pull(EndpointConfig::pull("http://x/telemetry"));
        transport.push_reply(MockReply::Body(snapshot_body(1.0)));
        let mut rx = h.shared.state.subscribe();

        h.send(Event::Start).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
    }
}
