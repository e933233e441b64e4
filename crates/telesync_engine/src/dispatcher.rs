//! Topic-based fan-out of telemetry updates to observers.
//!
//! Handlers run in registration order. A panicking handler is isolated: it is
//! logged and counted, and delivery continues with the next handler. The
//! handler list is snapshotted before each publish, so subscribing or
//! unsubscribing from inside a handler only affects later publishes.

use crate::error::EngineError;
use parking_lot::RwLock;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use telesync_protocol::{Envelope, Topic};
use tracing::warn;

/// One telemetry update delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// The facet the update belongs to.
    pub topic: Topic,
    /// The payload.
    pub data: Value,
    /// Idempotency key used for de-duplication.
    pub key: Option<String>,
}

impl Update {
    /// Creates an update without an idempotency key.
    pub fn new(topic: Topic, data: Value) -> Self {
        Self {
            topic,
            data,
            key: None,
        }
    }

    /// Sets the idempotency key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Builds an update from a stream envelope.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let key = envelope.idempotency_key();
        Self {
            topic: envelope.topic(),
            data: envelope.data,
            key,
        }
    }

    /// Builds an update from one snapshot facet. Facets carry no
    /// idempotency key: every fetched facet is fresh state.
    pub fn from_facet(topic: Topic, data: Value) -> Self {
        Self::new(topic, data)
    }
}

/// Which updates a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Every topic.
    All,
    /// A single topic.
    Only(Topic),
}

impl TopicFilter {
    /// Returns true if `topic` passes the filter.
    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Only(wanted) => wanted == topic,
        }
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        TopicFilter::Only(topic)
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handlers that panicked.
    pub panicked: usize,
}

type UpdateHandler = Arc<dyn Fn(&Update) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&EngineError) + Send + Sync>;

trait Release: Send + Sync {
    fn release(&self, id: u64) -> bool;
}

/// Copy-on-write handler list.
struct Registry<H> {
    next_id: AtomicU64,
    entries: RwLock<Arc<Vec<(u64, H)>>>,
}

impl<H: Clone> Registry<H> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn insert(&self, handler: H) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        let mut next = Vec::clone(&entries);
        next.push((id, handler));
        *entries = Arc::new(next);
        id
    }

    fn snapshot(&self) -> Arc<Vec<(u64, H)>> {
        Arc::clone(&self.entries.read())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl<H: Clone + Send + Sync> Release for Registry<H> {
    fn release(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|(entry, _)| *entry == id) {
            return false;
        }
        let next: Vec<_> = entries
            .iter()
            .filter(|(entry, _)| *entry != id)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        true
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Release>,
}

impl Subscription {
    fn new<H: Clone + Send + Sync + 'static>(id: u64, registry: &Arc<Registry<H>>) -> Self {
        let registry: Arc<dyn Release> = registry.clone();
        Self {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Removes the handler. Returns false if it was already removed.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.release(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Fans updates out to subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry<(TopicFilter, UpdateHandler)>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Registers `handler` for updates passing `filter`.
    pub fn subscribe<F>(&self, filter: impl Into<TopicFilter>, handler: F) -> Subscription
    where
        F: Fn(&Update) + Send + Sync + 'static,
    {
        let handler: UpdateHandler = Arc::new(handler);
        let id = self.registry.insert((filter.into(), handler));
        Subscription::new(id, &self.registry)
    }

    /// Delivers `update` to every matching handler in registration order.
    /// Publishing a topic nobody subscribed to is a no-op.
    pub fn publish(&self, update: &Update) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (id, (filter, handler)) in self.registry.snapshot().iter() {
            if !filter.matches(&update.topic) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(update))) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.panicked += 1;
                    warn!(topic = %update.topic, subscriber = id, "update handler panicked");
                }
            }
        }
        report
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Fans surfaced errors out to `on_error` observers.
#[derive(Clone)]
pub struct ErrorChannel {
    registry: Arc<Registry<ErrorHandler>>,
}

impl ErrorChannel {
    /// Creates a channel with no observers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Registers an error observer.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        let id = self.registry.insert(handler);
        Subscription::new(id, &self.registry)
    }

    /// Reports `error` to every observer. Returns how many returned normally.
    pub fn emit(&self, error: &EngineError) -> usize {
        let mut delivered = 0;
        for (id, handler) in self.registry.snapshot().iter() {
            match catch_unwind(AssertUnwindSafe(|| handler(error))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(observer = id, %error, "error observer panicked"),
            }
        }
        delivered
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.registry.len()
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn metrics(cpu: f64) -> Update {
        Update::new(Topic::Metrics, json!({ "cpu": cpu }))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> UpdateHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> UpdateHandler {
            let sink = Arc::clone(&sink);
            Arc::new(move |update: &Update| sink.lock().push(format!("{name}:{}", update.topic)))
        };
        (log, make)
    }

    #[test]
    fn delivers_in_registration_order() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let a = make("a");
        let all = make("all");
        let b = make("b");
        let _s1 = dispatcher.subscribe(Topic::Metrics, move |u: &Update| a(u));
        let _s2 = dispatcher.subscribe(TopicFilter::All, move |u: &Update| all(u));
        let _s3 = dispatcher.subscribe(Topic::Metrics, move |u: &Update| b(u));

        let report = dispatcher.publish(&metrics(1.0));
        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock(), vec!["a:metrics", "all:metrics", "b:metrics"]);

        log.lock().clear();
        dispatcher.publish(&Update::new(Topic::Events, json!([])));
        assert_eq!(*log.lock(), vec!["all:events"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let dispatcher = Dispatcher::new();
        let first = Arc::new(Mutex::new(0));
        let third = Arc::new(Mutex::new(0));

        let f = Arc::clone(&first);
        let _s1 = dispatcher.subscribe(Topic::Metrics, move |_: &Update| *f.lock() += 1);
        let _s2 = dispatcher.subscribe(Topic::Metrics, |_: &Update| panic!("observer bug"));
        let t = Arc::clone(&third);
        let _s3 = dispatcher.subscribe(Topic::Metrics, move |_: &Update| *t.lock() += 1);

        let report = dispatcher.publish(&metrics(2.0));
        assert_eq!(report, DispatchReport { delivered: 2, panicked: 1 });
        assert_eq!(*first.lock(), 1);
        assert_eq!(*third.lock(), 1);
    }

    #[test]
    fn unsubscribe_takes_effect() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let sub = dispatcher.subscribe(Topic::Metrics, move |_: &Update| *c.lock() += 1);

        dispatcher.publish(&metrics(1.0));
        assert!(sub.unsubscribe());
        dispatcher.publish(&metrics(2.0));

        assert_eq!(*count.lock(), 1);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.publish(&metrics(1.0)), DispatchReport::default());
    }

    #[test]
    fn subscribe_inside_handler_applies_to_next_publish() {
        let dispatcher = Dispatcher::new();
        let late = Arc::new(Mutex::new(0));
        let held = Arc::new(Mutex::new(Vec::new()));

        let inner = dispatcher.clone();
        let late_sink = Arc::clone(&late);
        let held_sink = Arc::clone(&held);
        let _outer = dispatcher.subscribe(Topic::Metrics, move |_: &Update| {
            if held_sink.lock().is_empty() {
                let l = Arc::clone(&late_sink);
                let sub = inner.subscribe(Topic::Metrics, move |_: &Update| *l.lock() += 1);
                held_sink.lock().push(sub);
            }
        });

        dispatcher.publish(&metrics(1.0));
        assert_eq!(*late.lock(), 0);
        dispatcher.publish(&metrics(2.0));
        assert_eq!(*late.lock(), 1);
    }

    #[test]
    fn unsubscribe_inside_handler_applies_to_next_publish() {
        let dispatcher = Dispatcher::new();
        let calls = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let c = Arc::clone(&calls);
        let s = Arc::clone(&slot);
        let sub = dispatcher.subscribe(Topic::Metrics, move |_: &Update| {
            *c.lock() += 1;
            if let Some(sub) = s.lock().take() {
                assert!(sub.unsubscribe());
            }
        });
        *slot.lock() = Some(sub);

        dispatcher.publish(&metrics(1.0));
        dispatcher.publish(&metrics(2.0));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn update_keys() {
        let env = Envelope::for_topic(&Topic::Events, json!({ "id": 42, "kind": "attack" }));
        assert_eq!(Update::from_envelope(env).key, None);

        let env = Envelope::for_topic(&Topic::Events, json!({})).with_id("evt-1");
        assert_eq!(Update::from_envelope(env).key.as_deref(), Some("evt-1"));

        let facet = Update::from_facet(Topic::Events, json!([{ "id": 1 }]));
        assert_eq!(facet.key, None);
        let facet = Update::from_facet(Topic::Metrics, json!({ "id": "host-1", "cpu": 3 }));
        assert_eq!(facet.key, None);
    }

    #[test]
    fn error_channel_fans_out() {
        let channel = ErrorChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sub = channel.subscribe(move |e: &EngineError| s.lock().push(e.clone()));
        let _bad = channel.subscribe(|_: &EngineError| panic!("observer bug"));

        assert_eq!(channel.emit(&EngineError::NotConnected), 1);
        assert!(sub.unsubscribe());
        assert_eq!(channel.emit(&EngineError::NotConnected), 0);
        assert_eq!(*seen.lock(), vec![EngineError::NotConnected]);
    }
}
