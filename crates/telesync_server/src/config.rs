//! Server configuration.

use std::net::SocketAddr;

/// Configuration for the telemetry server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Frames buffered per stream client before it starts lagging.
    pub stream_buffer: usize,
    /// Whether `ping` frames are answered with `pong`.
    pub answer_pings: bool,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            stream_buffer: 256,
            answer_pings: true,
        }
    }

    /// Sets the per-client stream buffer.
    pub fn with_stream_buffer(mut self, frames: usize) -> Self {
        self.stream_buffer = frames.max(1);
        self
    }

    /// Enables or disables heartbeat replies.
    pub fn with_answer_pings(mut self, answer: bool) -> Self {
        self.answer_pings = answer;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
