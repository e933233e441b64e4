//! Connection state and engine statistics.

use std::fmt;
use std::time::{Duration, Instant};

/// The current state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not running. Initial state, and the state after `stop` or `reset`.
    #[default]
    Disconnected,
    /// A connection attempt (pull fetch or stream open) is in flight.
    Connecting,
    /// The last attempt succeeded.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Recovering,
    /// Automatic recovery gave up; only `reset` leaves this state.
    Failed,
}

impl ConnectionState {
    /// Returns true if the engine is trying to stay connected.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Recovering
        )
    }

    /// Returns true if `start` would begin a connection attempt.
    pub fn can_start(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    /// Returns true if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recovering => "recovering",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters describing engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Successful sync operations (pull fetches or stream opens).
    pub syncs_completed: u64,
    /// Recoverable failures.
    pub failures: u64,
    /// Attempts started from the `Recovering` state.
    pub reconnect_attempts: u64,
    /// Stale operations force-released by the guard.
    pub guard_timeouts: u64,
    /// Updates handed to the dispatcher.
    pub messages_dispatched: u64,
    /// Updates dropped as duplicates.
    pub duplicates_dropped: u64,
    /// Latency of the last successful operation.
    pub last_latency: Option<Duration>,
    /// Mean latency over the scheduler's sample ring.
    pub average_latency: Option<Duration>,
    /// Last surfaced error message.
    pub last_error: Option<String>,
    /// Time of the last successful operation.
    pub last_success: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_checks() {
        assert!(ConnectionState::Disconnected.can_start());
        assert!(!ConnectionState::Failed.can_start());
        assert!(!ConnectionState::Connected.can_start());

        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Recovering.is_active());
        assert!(!ConnectionState::Failed.is_active());
        assert!(!ConnectionState::Disconnected.is_active());

        assert!(ConnectionState::Failed.is_terminal());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn display() {
        assert_eq!(ConnectionState::Recovering.to_string(), "recovering");
    }

    #[test]
    fn stats_start_empty() {
        let stats = EngineStats::default();
        assert_eq!(stats.syncs_completed, 0);
        assert!(stats.last_error.is_none());
    }
}
