//! Stream envelopes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved outbound type sent by the engine at the keepalive interval.
pub const PING_TYPE: &str = "ping";

/// Reserved inbound type acknowledging a heartbeat. Never dispatched.
pub const PONG_TYPE: &str = "pong";

/// A single push-stream frame: `{ "type": string, "data": any }`.
///
/// An optional `id` acts as an idempotency key for de-duplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message payload.
    #[serde(default)]
    pub data: Value,
    /// Idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            id: None,
        }
    }

    /// Creates an envelope for a topic.
    pub fn for_topic(topic: &Topic, data: Value) -> Self {
        Self::new(topic.as_str(), data)
    }

    /// Creates a heartbeat request.
    pub fn ping() -> Self {
        Self::new(PING_TYPE, Value::Null)
    }

    /// Creates a heartbeat acknowledgment.
    pub fn pong() -> Self {
        Self::new(PONG_TYPE, Value::Null)
    }

    /// Sets the idempotency key.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Returns true if this is a heartbeat request.
    pub fn is_ping(&self) -> bool {
        self.kind == PING_TYPE
    }

    /// Returns true if this is a heartbeat acknowledgment.
    pub fn is_pong(&self) -> bool {
        self.kind == PONG_TYPE
    }

    /// Returns the topic of this envelope.
    pub fn topic(&self) -> Topic {
        Topic::parse(&self.kind)
    }

    /// Returns the idempotency key, if any.
    ///
    /// Only the top-level `id` counts. Payload fields are state, and an
    /// `id` inside the payload names an entity, not a delivery.
    pub fn idempotency_key(&self) -> Option<String> {
        self.id.clone()
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(ProtocolError::encode)
    }

    /// Decodes from a JSON text frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::decode)?;
        if envelope.kind.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty type".into()));
        }
        Ok(envelope)
    }

    /// Decodes from raw frame bytes.
    pub fn decode_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::Decode(format!("frame is not utf-8: {e}")))?;
        Self::decode(text)
    }
}
