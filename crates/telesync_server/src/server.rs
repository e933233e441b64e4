//! Main telemetry server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, RequestHandler, HEALTH_PATH, STREAM_PATH, TELEMETRY_PATH};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use telesync_protocol::{Envelope, Snapshot, Topic};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// The reference telemetry server.
///
/// Holds the current snapshot served to pull clients and fans envelopes
/// out to push clients. The request logic is usable in-process without
/// binding a socket; [`serve`](Self::serve) exposes it over HTTP:
///
/// - `GET /telemetry` returns the snapshot as JSON
/// - `GET /stream` upgrades to a WebSocket of envelopes
/// - `GET /health` returns `OK`
///
/// # Example
///
/// ```
/// use telesync_server::{ServerConfig, TelemetryServer};
/// use telesync_protocol::Topic;
/// use serde_json::json;
///
/// let server = TelemetryServer::new(ServerConfig::default());
/// server.update(Topic::Metrics, json!({ "cpu": 12.5 }));
/// assert!(server.snapshot().metrics.is_some());
/// ```
pub struct TelemetryServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl TelemetryServer {
    /// Creates a server with an empty snapshot.
    pub fn new(config: ServerConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.context.snapshot()
    }

    /// Replaces the snapshot served to pull clients.
    pub fn set_snapshot(&self, snapshot: Snapshot) {
        self.context.set_snapshot(snapshot);
    }

    /// Records a new value for `topic`: the matching snapshot facet is
    /// replaced and the value is pushed to stream clients.
    ///
    /// Returns the number of stream clients reached.
    pub fn update(&self, topic: Topic, data: Value) -> usize {
        if topic.is_snapshot_facet() && !self.context.set_facet(&topic, data.clone()) {
            warn!(%topic, "value does not fit snapshot facet; stream only");
        }
        let envelope = Envelope::for_topic(&topic, data);
        self.publish(&envelope).unwrap_or(0)
    }

    /// Pushes an envelope to stream clients without touching the snapshot.
    pub fn publish(&self, envelope: &Envelope) -> ServerResult<usize> {
        Ok(self.context.broadcast(envelope.encode()?))
    }

    /// Encodes the current snapshot as a pull response body.
    pub fn fetch_body(&self) -> ServerResult<Vec<u8>> {
        self.handler.fetch_body()
    }

    /// Handles a GET request for `path`.
    pub fn handle_get(&self, path: &str) -> ServerResult<Vec<u8>> {
        self.handler.handle_get(path)
    }

    /// Handles an inbound stream frame and returns the reply, if any.
    pub fn handle_frame(&self, text: &str) -> ServerResult<Option<String>> {
        self.handler.handle_frame(text)
    }

    /// Subscribes to outbound stream frames.
    pub fn stream(&self) -> broadcast::Receiver<String> {
        self.context.subscribe()
    }

    /// Number of connected stream clients.
    pub fn stream_clients(&self) -> usize {
        self.context.stream_clients()
    }

    /// Enables or disables heartbeat replies.
    pub fn set_answer_pings(&self, answer: bool) {
        self.context.set_answer_pings(answer);
    }

    /// Number of snapshot fetches served.
    pub fn fetch_count(&self) -> u64 {
        self.context.fetch_count()
    }

    /// Builds the HTTP router.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(TELEMETRY_PATH, get(telemetry_handler))
            .route(STREAM_PATH, get(stream_handler))
            .route(HEALTH_PATH, get(health_handler))
            .with_state(Arc::clone(self))
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.context.config.bind_addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve_listener<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, "telemetry server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("telemetry server shutting down");
            })
            .await?;
        Ok(())
    }
}

async fn telemetry_handler(State(server): State<Arc<TelemetryServer>>) -> Response {
    match server.fetch_body() {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, e.to_string()).into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<TelemetryServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<TelemetryServer>) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let mut frames = server.stream();
    info!(client_id, "stream client connected");

    loop {
        tokio::select! {
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match server.handle_frame(text.as_str()) {
                        Ok(Some(reply)) => {
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(client_id, error = %e, "bad client frame"),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            outbound = frames.recv() => {
                match outbound {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "stream client lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(client_id, "stream client disconnected");
}
