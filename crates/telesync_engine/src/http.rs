//! HTTP pull transport.
//!
//! The HTTP client is abstracted behind [`HttpClient`] so the transport can
//! run over reqwest in production or be routed in-process to a server with
//! [`LoopbackClient`].

use crate::error::{EngineError, EngineResult};
use crate::transport::{PullTransport, TransportFuture};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync + 'static {
    /// Sends a GET request and returns the response body.
    ///
    /// Non-success statuses are errors.
    fn get(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>, String>>;
}

/// [`HttpClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with reqwest's default settings.
    pub fn new() -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing reqwest client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>, String>> {
        let request = self.client.get(url);
        Box::pin(async move {
            let response = request.send().await.map_err(|e| e.to_string())?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("unexpected status {status}"));
            }
            let body = response.bytes().await.map_err(|e| e.to_string())?;
            Ok(body.to_vec())
        })
    }
}

/// Pull transport that fetches a snapshot with one GET per call.
///
/// Holds no connection of its own: pooling belongs to the client, so
/// [`close`](PullTransport::close) has nothing to release.
pub struct HttpTransport<C: HttpClient> {
    url: String,
    client: Arc<C>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for `url`.
    pub fn new(url: impl Into<String>, client: C) -> Self {
        Self {
            url: url.into(),
            client: Arc::new(client),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

impl<C: HttpClient> PullTransport for HttpTransport<C> {
    fn execute(&self) -> TransportFuture<Vec<u8>> {
        let request = self.client.get(&self.url);
        let last_error = Arc::clone(&self.last_error);
        Box::pin(async move {
            match request.await {
                Ok(body) => {
                    *last_error.write() = None;
                    Ok(body)
                }
                Err(message) => {
                    *last_error.write() = Some(message.clone());
                    Err(EngineError::transport(message))
                }
            }
        })
    }

    fn close(&self) {}
}

/// Servers that can answer loopback GET requests.
pub trait LoopbackServer: Send + Sync + 'static {
    /// Handles a GET request for `path` and returns the response body.
    fn handle_get(&self, path: &str) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer> LoopbackServer for Arc<S> {
    fn handle_get(&self, path: &str) -> Result<Vec<u8>, String> {
        (**self).handle_get(path)
    }
}

/// An HTTP client that routes requests directly to a server in-process.
///
/// Useful for testing without network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: Arc<S>,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a loopback client for `server`.
    pub fn new(server: S) -> Self {
        Self {
            server: Arc::new(server),
        }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn get(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>, String>> {
        let result = self.server.handle_get(url_path(url));
        Box::pin(async move { result })
    }
}

/// Extracts the path component of an absolute URL.
fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct TestServer {
        paths: Mutex<Vec<String>>,
        response: Mutex<Result<Vec<u8>, String>>,
    }

    impl TestServer {
        fn new(response: Result<Vec<u8>, String>) -> Self {
            Self {
                paths: Mutex::new(Vec::new()),
                response: Mutex::new(response),
            }
        }
    }

    impl LoopbackServer for TestServer {
        fn handle_get(&self, path: &str) -> Result<Vec<u8>, String> {
            self.paths.lock().push(path.to_string());
            self.response.lock().clone()
        }
    }

    #[test]
    fn url_path_extraction() {
        assert_eq!(url_path("http://localhost:8080/telemetry"), "/telemetry");
        assert_eq!(url_path("https://example.com/a/b?c=1"), "/a/b?c=1");
        assert_eq!(url_path("http://example.com"), "/");
        assert_eq!(url_path("/already/a/path"), "/already/a/path");
    }

    #[tokio::test]
    async fn loopback_fetch() {
        let server = Arc::new(TestServer::new(Ok(b"{}".to_vec())));
        let transport = HttpTransport::new(
            "http://telemetry.local/telemetry",
            LoopbackClient::new(Arc::clone(&server)),
        );

        assert_eq!(transport.url(), "http://telemetry.local/telemetry");
        assert_eq!(transport.execute().await.unwrap(), b"{}".to_vec());
        assert_eq!(*server.paths.lock(), vec!["/telemetry".to_string()]);
        assert!(transport.last_error().is_none());
    }

    #[tokio::test]
    async fn failure_is_transport_error() {
        let server = TestServer::new(Err("connection refused".into()));
        let transport = HttpTransport::new("http://x/telemetry", LoopbackClient::new(server));

        let err = transport.execute().await.unwrap_err();
        assert_eq!(err, EngineError::transport("connection refused"));
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn fetches_continue_after_close() {
        let server = Arc::new(TestServer::new(Ok(b"{}".to_vec())));
        let transport = HttpTransport::new("http://x/telemetry", LoopbackClient::new(Arc::clone(&server)));

        transport.execute().await.unwrap();
        transport.close();
        transport.close();
        assert_eq!(transport.execute().await.unwrap(), b"{}".to_vec());
        assert_eq!(server.paths.lock().len(), 2);
    }
}
