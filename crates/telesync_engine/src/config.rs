//! Configuration for the synchronization engine.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// The kind of transport an endpoint is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Periodic request/response fetches.
    #[default]
    Pull,
    /// A persistent message stream.
    Push,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Pull => f.write_str("pull"),
            TransportKind::Push => f.write_str("push"),
        }
    }
}

/// Configuration for one telemetry endpoint.
///
/// Immutable once handed to a supervisor. The JSON form uses camelCase keys
/// with millisecond integers (`baseBackoffMs`, `keepaliveMs`, ...); missing
/// keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointConfig {
    /// Pull or push.
    pub transport_kind: TransportKind,
    /// Target address (an `http(s)://` URL for pull, `ws(s)://` for push).
    pub endpoint: String,
    /// Backoff delay after the first failure.
    #[serde(rename = "baseBackoffMs", with = "millis")]
    pub base_backoff: Duration,
    /// Upper bound on backoff delays.
    #[serde(rename = "maxBackoffMs", with = "millis")]
    pub max_backoff: Duration,
    /// Consecutive reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Heartbeat interval for push transports.
    #[serde(rename = "keepaliveMs", with = "millis")]
    pub keepalive: Duration,
    /// Silence after which a push connection is considered dead.
    /// Defaults to twice the keepalive interval.
    #[serde(
        rename = "silenceTimeoutMs",
        with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub silence_timeout: Option<Duration>,
    /// Per-operation timeout.
    #[serde(rename = "operationTimeoutMs", with = "millis")]
    pub operation_timeout: Duration,
    /// Failsafe after which the guard force-releases a leaked operation.
    #[serde(rename = "guardSafetyTimeoutMs", with = "millis")]
    pub guard_safety_timeout: Duration,
    /// Latencies below this are "fast".
    #[serde(rename = "fastBandMs", with = "millis")]
    pub fast_band: Duration,
    /// Latencies below this (and not fast) are "moderate".
    #[serde(rename = "moderateBandMs", with = "millis")]
    pub moderate_band: Duration,
    /// Poll interval for the fast band.
    #[serde(rename = "minPollIntervalMs", with = "millis")]
    pub min_poll_interval: Duration,
    /// Poll interval for the moderate band.
    #[serde(rename = "basePollIntervalMs", with = "millis")]
    pub base_poll_interval: Duration,
    /// Poll interval for the slow band.
    #[serde(rename = "maxPollIntervalMs", with = "millis")]
    pub max_poll_interval: Duration,
    /// Poll interval while degraded.
    #[serde(rename = "degradedPollIntervalMs", with = "millis")]
    pub degraded_poll_interval: Duration,
    /// Failure count above which the degraded interval applies.
    pub degraded_after_failures: u32,
    /// Number of latency samples kept.
    pub latency_samples: usize,
    /// Number of idempotency keys remembered for de-duplication.
    pub dedup_window: usize,
}

impl EndpointConfig {
    /// Creates a configuration for the given endpoint with default tuning.
    pub fn new(transport_kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            transport_kind,
            endpoint: endpoint.into(),
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            keepalive: Duration::from_millis(15_000),
            silence_timeout: None,
            operation_timeout: Duration::from_millis(10_000),
            guard_safety_timeout: Duration::from_millis(30_000),
            fast_band: Duration::from_millis(200),
            moderate_band: Duration::from_millis(500),
            min_poll_interval: Duration::from_millis(1000),
            base_poll_interval: Duration::from_millis(2000),
            max_poll_interval: Duration::from_millis(5000),
            degraded_poll_interval: Duration::from_millis(15_000),
            degraded_after_failures: 3,
            latency_samples: 20,
            dedup_window: 256,
        }
    }

    /// Creates a pull configuration.
    pub fn pull(endpoint: impl Into<String>) -> Self {
        Self::new(TransportKind::Pull, endpoint)
    }

    /// Creates a push configuration.
    pub fn push(endpoint: impl Into<String>) -> Self {
        Self::new(TransportKind::Push, endpoint)
    }

    /// Sets the backoff base and cap.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Sets the reconnect attempt limit.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the keepalive interval.
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Sets the silence timeout explicitly.
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = Some(timeout);
        self
    }

    /// Sets the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the guard safety timeout.
    pub fn with_guard_safety_timeout(mut self, timeout: Duration) -> Self {
        self.guard_safety_timeout = timeout;
        self
    }

    /// Sets the latency band thresholds.
    pub fn with_bands(mut self, fast: Duration, moderate: Duration) -> Self {
        self.fast_band = fast;
        self.moderate_band = moderate;
        self
    }

    /// Sets the healthy poll intervals (fast, moderate, slow bands).
    pub fn with_poll_intervals(mut self, min: Duration, base: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.base_poll_interval = base;
        self.max_poll_interval = max;
        self
    }

    /// Sets the degraded poll interval and the failure count that triggers it.
    pub fn with_degraded(mut self, interval: Duration, after_failures: u32) -> Self {
        self.degraded_poll_interval = interval;
        self.degraded_after_failures = after_failures;
        self
    }

    /// Sets the de-duplication window size.
    pub fn with_dedup_window(mut self, size: usize) -> Self {
        self.dedup_window = size;
        self
    }

    /// Returns the effective silence timeout.
    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
            .unwrap_or_else(|| self.keepalive.saturating_mul(2))
    }

    /// Parses a configuration from its JSON form.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    /// Renders the configuration in its JSON form.
    pub fn to_json_pretty(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidConfig(msg.to_string()));

        if self.endpoint.trim().is_empty() {
            return invalid("endpoint must not be empty");
        }
        if self.base_backoff.is_zero() {
            return invalid("baseBackoffMs must be positive");
        }
        if self.operation_timeout.is_zero() || self.guard_safety_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        if self.transport_kind == TransportKind::Push && self.keepalive.is_zero() {
            return invalid("keepaliveMs must be positive for push transports");
        }
        if self.silence_timeout() < self.keepalive {
            return invalid("silenceTimeoutMs must not be shorter than keepaliveMs");
        }
        if self.fast_band > self.moderate_band {
            return invalid("fastBandMs must not exceed moderateBandMs");
        }
        if self.min_poll_interval.is_zero()
            || self.min_poll_interval > self.base_poll_interval
            || self.base_poll_interval > self.max_poll_interval
        {
            return invalid("poll intervals must satisfy 0 < min <= base <= max");
        }
        if self.degraded_poll_interval <= self.max_poll_interval {
            return invalid("degradedPollIntervalMs must exceed maxPollIntervalMs");
        }
        if self.latency_samples == 0 {
            return invalid("latencySamples must be positive");
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new(TransportKind::Pull, "")
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
