//! Update topics.

use std::fmt;

/// The facet of telemetry an update belongs to.
///
/// The four well-known facets of a telemetry snapshot have their own
/// variants; any other stream message type is carried as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Host and sensor metrics.
    Metrics,
    /// Active network connections.
    Connections,
    /// Observed processes.
    Processes,
    /// Detection events.
    Events,
    /// Any other message type.
    Custom(String),
}

impl Topic {
    /// Returns the wire name of this topic.
    pub fn as_str(&self) -> &str {
        match self {
            Topic::Metrics => "metrics",
            Topic::Connections => "connections",
            Topic::Processes => "processes",
            Topic::Events => "events",
            Topic::Custom(name) => name,
        }
    }

    /// Parses a wire name into a topic.
    pub fn parse(name: &str) -> Self {
        match name {
            "metrics" => Topic::Metrics,
            "connections" => Topic::Connections,
            "processes" => Topic::Processes,
            "events" => Topic::Events,
            other => Topic::Custom(other.to_string()),
        }
    }

    /// Returns true for the four facets a snapshot can carry.
    pub fn is_snapshot_facet(&self) -> bool {
        !matches!(self, Topic::Custom(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::parse(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::parse(&name)
    }
}
