//! Pull-style telemetry snapshots.

use crate::error::{ProtocolError, ProtocolResult};
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One complete telemetry payload returned by a pull-style fetch.
///
/// Every facet is optional. An absent (or `null`) facet means "no update for
/// that facet", not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Host and sensor metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Active network connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<Value>>,
    /// Observed processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<Value>>,
    /// Detection events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Value>>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the metrics facet.
    pub fn with_metrics(mut self, metrics: Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sets the connections facet.
    pub fn with_connections(mut self, connections: Vec<Value>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Sets the processes facet.
    pub fn with_processes(mut self, processes: Vec<Value>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Sets the events facet.
    pub fn with_events(mut self, events: Vec<Value>) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns true if no facet is present.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_none()
            && self.connections.is_none()
            && self.processes.is_none()
            && self.events.is_none()
    }

    /// Replaces the facet for `topic` with `data`.
    ///
    /// Returns false (leaving the snapshot untouched) for custom topics, or
    /// when a list facet is given a non-array value.
    pub fn set_facet(&mut self, topic: &Topic, data: Value) -> bool {
        match topic {
            Topic::Metrics => self.metrics = Some(data),
            Topic::Connections | Topic::Processes | Topic::Events => {
                let Value::Array(items) = data else {
                    return false;
                };
                match topic {
                    Topic::Connections => self.connections = Some(items),
                    Topic::Processes => self.processes = Some(items),
                    _ => self.events = Some(items),
                }
            }
            Topic::Custom(_) => return false,
        }
        true
    }

    /// Splits the snapshot into per-topic payloads.
    ///
    /// Facets are returned in a fixed order: metrics, connections,
    /// processes, events. Absent facets are skipped.
    pub fn into_facets(self) -> Vec<(Topic, Value)> {
        let mut facets = Vec::with_capacity(4);
        if let Some(metrics) = self.metrics {
            facets.push((Topic::Metrics, metrics));
        }
        if let Some(connections) = self.connections {
            facets.push((Topic::Connections, Value::Array(connections)));
        }
        if let Some(processes) = self.processes {
            facets.push((Topic::Processes, Value::Array(processes)));
        }
        if let Some(events) = self.events {
            facets.push((Topic::Events, Value::Array(events)));
        }
        facets
    }

    /// Encodes to a JSON document.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(ProtocolError::encode)
    }

    /// Decodes from a JSON document.
    ///
    /// The document must be a JSON object; unknown fields are ignored.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        serde_json::from_slice(bytes).map_err(ProtocolError::decode)
    }
}
