//! Public engine handle.

use crate::clock::{Clock, TokioClock};
use crate::config::EndpointConfig;
use crate::dispatcher::{Subscription, TopicFilter, Update};
use crate::error::{EngineError, EngineResult};
use crate::state::{ConnectionState, EngineStats};
use crate::supervisor::{Event, Shared, Supervisor};
use crate::transport::TransportAdapter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// A running telemetry synchronization engine.
///
/// The engine owns one background task that serializes every state change.
/// Control methods only enqueue a command and never fail: errors are reported
/// asynchronously through [`on_error`](Self::on_error) observers.
///
/// Dropping the engine shuts the background task down.
pub struct Engine {
    config: EndpointConfig,
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Builds the transport described by `config` and spawns an engine on
    /// the current tokio runtime.
    pub fn connect(config: EndpointConfig) -> EngineResult<Self> {
        config.validate()?;
        let adapter = TransportAdapter::for_endpoint(&config)?;
        Self::spawn(config, adapter, Arc::new(TokioClock::new()))
    }

    /// Spawns an engine with an explicit transport and clock.
    ///
    /// Must be called from within a tokio runtime. The engine starts in the
    /// `Disconnected` state; call [`start`](Self::start) to connect.
    pub fn spawn(
        config: EndpointConfig,
        adapter: TransportAdapter,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        if adapter.kind() != config.transport_kind {
            return Err(EngineError::InvalidConfig(format!(
                "transport is {} but configuration asks for {}",
                adapter.kind(),
                config.transport_kind
            )));
        }

        let shared = Arc::new(Shared::new());
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            config.clone(),
            adapter,
            clock,
            Arc::clone(&shared),
            events.clone(),
        );
        let task = tokio::spawn(run(supervisor, rx));

        Ok(Self {
            config,
            events,
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Begins connecting. Ignored unless the engine is `Disconnected`.
    pub fn start(&self) {
        self.send(Event::Start);
    }

    /// Cancels pending timers, closes the transport and returns to
    /// `Disconnected`. An in-flight operation is dropped silently.
    pub fn stop(&self) {
        self.send(Event::Stop);
    }

    /// Leaves any state (including `Failed`) for `Disconnected` with a clean
    /// backoff state.
    pub fn reset(&self) {
        self.send(Event::Reset);
    }

    /// Registers an update handler.
    pub fn subscribe<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> Subscription
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(filter, handler)
    }

    /// Registers an error observer.
    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.shared.errors.subscribe(handler)
    }

    /// Injects an update produced in-process. It goes through the same
    /// de-duplication and dispatch path as transport updates.
    pub fn publish_local(&self, update: Update) {
        self.send(Event::Local(update));
    }

    /// Returns true if the connection is currently healthy.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns a snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.shared.stats.read().clone()
    }

    /// Stops the engine and waits for its background task to exit.
    pub async fn shutdown(self) {
        self.send(Event::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("engine task has exited; command dropped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

async fn run(mut supervisor: Supervisor, mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        let shutdown = matches!(event, Event::Shutdown);
        supervisor.handle(event);
        if shutdown {
            break;
        }
    }
    debug!("engine task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::transport::{MockPullTransport, MockPushTransport, MockReply};
    use serde_json::json;
    use std::time::Duration;
    use telesync_protocol::{Snapshot, Topic};

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn body() -> Vec<u8> {
        Snapshot::new()
            .with_metrics(json!({ "cpu": 1 }))
            .with_events(vec![json!({ "id": 1 })])
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = EndpointConfig::pull("");
        let result = Engine::spawn(
            config,
            TransportAdapter::pull(MockPullTransport::new()),
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn rejects_transport_kind_mismatch() {
        let result = Engine::spawn(
            EndpointConfig::pull("http://x/telemetry"),
            TransportAdapter::push(MockPushTransport::new()),
            Arc::new(ManualClock::new()),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn start_subscribe_stop() {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(MockPullTransport::new());
        transport.set_fallback(MockReply::Body(body()));
        let engine = Engine::spawn(
            EndpointConfig::pull("http://x/telemetry"),
            TransportAdapter::Pull(transport.clone()),
            clock.clone(),
        )
        .unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let sub = engine.subscribe(Topic::Metrics, move |u: &Update| sink.lock().push(u.data.clone()));

        assert_eq!(engine.state(), ConnectionState::Disconnected);
        engine.start();
        settle().await;
        assert!(engine.is_connected());
        assert_eq!(*received.lock(), vec![json!({ "cpu": 1 })]);

        clock.advance(Duration::from_millis(1000));
        settle().await;
        assert_eq!(received.lock().len(), 2);

        assert!(sub.unsubscribe());
        clock.advance(Duration::from_millis(1000));
        settle().await;
        assert_eq!(received.lock().len(), 2);
        assert_eq!(transport.calls(), 3);

        engine.stop();
        settle().await;
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(engine.stats().syncs_completed, 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn errors_reach_observers() {
        let transport = MockPullTransport::new();
        transport.set_fallback(MockReply::Fail("connection refused".into()));
        let engine = Engine::spawn(
            EndpointConfig::pull("http://x/telemetry"),
            TransportAdapter::pull(transport),
            Arc::new(ManualClock::new()),
        )
        .unwrap();

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        let _sub = engine.on_error(move |e: &EngineError| sink.lock().push(e.kind()));

        engine.start();
        settle().await;
        assert_eq!(engine.state(), ConnectionState::Recovering);
        assert_eq!(*kinds.lock(), vec![ErrorKind::Transport]);
        assert!(engine.stats().last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn local_updates_are_deduplicated() {
        let engine = Engine::spawn(
            EndpointConfig::push("ws://x/stream"),
            TransportAdapter::push(MockPushTransport::new()),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let _sub = engine.subscribe(TopicFilter::All, move |_: &Update| *c.lock() += 1);

        let update = Update::new(Topic::Events, json!({ "kind": "attack" })).with_key("a-1");
        engine.publish_local(update.clone());
        engine.publish_local(update);
        settle().await;

        assert_eq!(*count.lock(), 1);
        assert_eq!(engine.stats().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn state_changes_stream() {
        let engine = Engine::spawn(
            EndpointConfig::push("ws://x/stream"),
            TransportAdapter::push(MockPushTransport::new()),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        let mut changes = engine.state_changes();

        engine.start();
        changes.changed().await.unwrap();
        settle().await;
        assert_eq!(*changes.borrow_and_update(), ConnectionState::Connected);

        engine.reset();
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_after_shutdown_are_ignored() {
        let engine = Engine::spawn(
            EndpointConfig::push("ws://x/stream"),
            TransportAdapter::push(MockPushTransport::new()),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        engine.send(Event::Shutdown);
        settle().await;
        engine.start();
        settle().await;
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }
}
