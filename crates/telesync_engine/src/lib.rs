//! # telesync Engine
//!
//! Resilient real-time telemetry synchronization.
//!
//! This crate provides:
//! - Connection supervisor (disconnected → connecting → connected →
//!   recovering → failed)
//! - Exponential reconnection backoff with an attempt ceiling
//! - A request guard allowing one in-flight operation, with a safety timeout
//! - Adaptive poll cadence driven by measured latency
//! - Pull (HTTP) and push (WebSocket) transports behind one adapter
//! - Topic-based dispatch of updates to observers, with de-duplication
//! - An injectable clock for deterministic tests
//!
//! ## Architecture
//!
//! Each [`Engine`] runs one background task that owns the supervisor and
//! processes events strictly one at a time. Transport calls and timers run
//! elsewhere and only post completion events back to that task, so no
//! connection state is ever shared or locked.
//!
//! ## Key Invariants
//!
//! - At most one sync operation is in flight
//! - Every delay is requested through the [`Clock`]
//! - A retry is never armed while another retry timer is pending
//! - Backoff resets on any success
//! - `Failed` is left only through an explicit reset
//! - Errors are reported to observers, never returned from control methods

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod clock;
mod config;
mod dedup;
mod dispatcher;
mod engine;
mod error;
mod guard;
mod http;
mod scheduler;
mod state;
mod supervisor;
mod transport;
mod ws;

pub use backoff::{BackoffPolicy, BackoffState};
pub use clock::{Clock, ManualClock, TimerCallback, TimerHandle, TokioClock};
pub use config::{EndpointConfig, TransportKind};
pub use dedup::DedupWindow;
pub use dispatcher::{DispatchReport, Dispatcher, ErrorChannel, Subscription, TopicFilter, Update};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use guard::{Acquired, OperationId, PendingOperation, Refused, RequestGuard, StaleOperation};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer, ReqwestClient};
pub use scheduler::{AdaptiveScheduler, Band, Sample, SchedulerConfig};
pub use state::{ConnectionState, EngineStats};
pub use transport::{
    MockOpen, MockPullTransport, MockPushTransport, MockReply, MockStream, PullTransport,
    PushTransport, StreamEvent, StreamEvents, StreamHandle, TransportAdapter, TransportFuture,
};
pub use ws::WebSocketTransport;
