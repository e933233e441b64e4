//! # telesync Protocol
//!
//! Wire types for the telesync telemetry synchronization engine.
//!
//! This crate provides:
//! - `Snapshot` for pull-style telemetry documents
//! - `Envelope` for push-style stream frames
//! - `Topic` naming the facet an update belongs to
//! - JSON encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod snapshot;
mod topic;

pub use envelope::{Envelope, PING_TYPE, PONG_TYPE};
pub use error::{ProtocolError, ProtocolResult};
pub use snapshot::Snapshot;
pub use topic::Topic;
