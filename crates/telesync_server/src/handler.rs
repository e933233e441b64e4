//! Request handlers for telemetry endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use telesync_protocol::{Envelope, Snapshot, Topic};
use tokio::sync::broadcast;
use tracing::debug;

/// Path serving the current snapshot.
pub const TELEMETRY_PATH: &str = "/telemetry";
/// Path upgraded to the push stream.
pub const STREAM_PATH: &str = "/stream";
/// Liveness path.
pub const HEALTH_PATH: &str = "/health";

/// State shared by every request.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    snapshot: RwLock<Snapshot>,
    stream: broadcast::Sender<String>,
    answer_pings: AtomicBool,
    fetches: AtomicU64,
    frames_published: AtomicU64,
}

impl HandlerContext {
    /// Creates a context with an empty snapshot.
    pub fn new(config: ServerConfig) -> Self {
        let (stream, _) = broadcast::channel(config.stream_buffer.max(1));
        Self {
            answer_pings: AtomicBool::new(config.answer_pings),
            config,
            snapshot: RwLock::new(Snapshot::new()),
            stream,
            fetches: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
        }
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Replaces the snapshot.
    pub fn set_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Replaces one facet of the snapshot.
    pub fn set_facet(&self, topic: &Topic, data: Value) -> bool {
        self.snapshot.write().set_facet(topic, data)
    }

    /// Sends a frame to every stream client. Returns how many received it.
    pub fn broadcast(&self, frame: String) -> usize {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error.
        self.stream.send(frame).unwrap_or(0)
    }

    /// Subscribes to outbound stream frames.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.stream.subscribe()
    }

    /// Number of connected stream clients.
    pub fn stream_clients(&self) -> usize {
        self.stream.receiver_count()
    }

    /// Returns whether pings are answered.
    pub fn answers_pings(&self) -> bool {
        self.answer_pings.load(Ordering::SeqCst)
    }

    /// Enables or disables heartbeat replies at runtime.
    pub fn set_answer_pings(&self, answer: bool) {
        self.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Number of snapshot fetches served.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Number of frames published to the stream.
    pub fn published_count(&self) -> u64 {
        self.frames_published.load(Ordering::Relaxed)
    }
}

/// Handler for telemetry requests, independent of the HTTP framework.
pub struct RequestHandler {
    context: std::sync::Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: std::sync::Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a GET request and returns the response body.
    pub fn handle_get(&self, path: &str) -> ServerResult<Vec<u8>> {
        let path = path.split('?').next().unwrap_or(path);
        if !path.starts_with('/') {
            return Err(ServerError::InvalidRequest(format!("malformed path {path:?}")));
        }
        match path {
            TELEMETRY_PATH => self.fetch_body(),
            HEALTH_PATH => Ok(b"OK".to_vec()),
            other => Err(ServerError::NotFound(other.to_string())),
        }
    }

    /// Encodes the current snapshot.
    pub fn fetch_body(&self) -> ServerResult<Vec<u8>> {
        self.context.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.context.snapshot.read().encode()?)
    }

    /// Handles one inbound stream frame and returns the reply, if any.
    ///
    /// `ping` is answered with `pong` (unless disabled); other frames are
    /// accepted and ignored.
    pub fn handle_frame(&self, text: &str) -> ServerResult<Option<String>> {
        let envelope = Envelope::decode(text)?;
        if envelope.is_ping() {
            if !self.context.answers_pings() {
                debug!("ping ignored");
                return Ok(None);
            }
            return Ok(Some(Envelope::pong().encode()?));
        }
        debug!(kind = %envelope.kind, "client frame ignored");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn handler() -> (Arc<HandlerContext>, RequestHandler) {
        let context = Arc::new(HandlerContext::new(ServerConfig::default()));
        let handler = RequestHandler::new(Arc::clone(&context));
        (context, handler)
    }

    #[test]
    fn serves_snapshot() {
        let (context, handler) = handler();
        context.set_snapshot(Snapshot::new().with_metrics(json!({ "cpu": 5 })));

        let body = handler.handle_get("/telemetry?since=0").unwrap();
        let snapshot = Snapshot::decode(&body).unwrap();
        assert_eq!(snapshot.metrics, Some(json!({ "cpu": 5 })));
        assert_eq!(context.fetch_count(), 1);
    }

    #[test]
    fn unknown_path() {
        let (_, handler) = handler();
        assert!(matches!(
            handler.handle_get("/sync/pull"),
            Err(ServerError::NotFound(_))
        ));
        assert_eq!(handler.handle_get("/health").unwrap(), b"OK".to_vec());
        assert!(matches!(
            handler.handle_get("telemetry"),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn answers_ping() {
        let (context, handler) = handler();
        let reply = handler.handle_frame(r#"{"type":"ping"}"#).unwrap().unwrap();
        assert!(Envelope::decode(&reply).unwrap().is_pong());

        context.set_answer_pings(false);
        assert_eq!(handler.handle_frame(r#"{"type":"ping"}"#).unwrap(), None);
        assert_eq!(handler.handle_frame(r#"{"type":"hello"}"#).unwrap(), None);
    }

    #[test]
    fn malformed_frame_is_rejected() {
        let (_, handler) = handler();
        let err = handler.handle_frame("{oops").unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let (context, _) = handler();
        assert_eq!(context.broadcast("dropped".into()), 0);

        let mut rx = context.subscribe();
        assert_eq!(context.stream_clients(), 1);
        assert_eq!(context.broadcast("frame".into()), 1);
        assert_eq!(rx.recv().await.unwrap(), "frame");
        assert_eq!(context.published_count(), 2);
    }
}
