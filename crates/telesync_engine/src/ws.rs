//! WebSocket push transport.

use crate::error::{EngineError, EngineResult};
use crate::transport::{PushTransport, StreamEvents, StreamHandle, TransportFuture};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

/// Push transport over a WebSocket connection.
///
/// Each `open` dials a fresh connection. Text frames are delivered as
/// stream messages; binary frames are ignored.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Creates a transport for a `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushTransport for WebSocketTransport {
    fn open(&self, events: StreamEvents) -> TransportFuture<Box<dyn StreamHandle>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| EngineError::transport(format!("connect {url}: {e}")))?;
            debug!(%url, "websocket connected");

            let (mut write, mut read) = stream.split();
            let open = Arc::new(AtomicBool::new(true));
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

            let writer = tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = write.send(message).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = write.close().await;
            });

            let reader_open = Arc::clone(&open);
            let reader = tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    if !reader_open.load(Ordering::SeqCst) {
                        return;
                    }
                    match frame {
                        Ok(Message::Text(text)) => events.message(text.as_str()),
                        Ok(Message::Close(frame)) => {
                            reader_open.store(false, Ordering::SeqCst);
                            events.closed(frame.map(|f| f.reason.as_str().to_owned()));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            reader_open.store(false, Ordering::SeqCst);
                            warn!(error = %e, "websocket read failed");
                            events.error(EngineError::transport(e.to_string()));
                            return;
                        }
                    }
                }
                if reader_open.swap(false, Ordering::SeqCst) {
                    events.closed(None);
                }
            });

            Ok(Box::new(WebSocketHandle {
                outbound,
                open,
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            }) as Box<dyn StreamHandle>)
        })
    }
}

struct WebSocketHandle {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl StreamHandle for WebSocketHandle {
    fn send(&self, frame: String) -> EngineResult<()> {
        if !self.is_open() {
            return Err(EngineError::NotConnected);
        }
        self.outbound
            .send(Message::text(frame))
            .map_err(|_| EngineError::NotConnected)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.reader.abort();
            // The writer exits after flushing the close frame.
            if self.outbound.send(Message::Close(None)).is_err() {
                self.writer.abort();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}
