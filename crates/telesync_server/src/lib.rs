//! # telesync Server
//!
//! Reference telemetry endpoint for the telesync engine.
//!
//! This crate provides:
//! - `GET /telemetry`: the current snapshot, for pull clients
//! - `GET /stream`: a WebSocket of envelopes, for push clients
//! - `GET /health`: liveness
//! - Heartbeat replies (`ping` is answered with `pong`)
//!
//! # Architecture
//!
//! [`TelemetryServer`] keeps the latest snapshot and a broadcast channel of
//! outbound frames. Request logic lives in [`RequestHandler`] so it can be
//! driven in-process by tests; axum only adapts it to HTTP.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler, HEALTH_PATH, STREAM_PATH, TELEMETRY_PATH};
pub use server::TelemetryServer;
