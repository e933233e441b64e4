//! Reconnection backoff.

use std::time::Duration;

/// Exponential backoff: `delay(n) = min(base * 2^(n - 1), cap)` for `n >= 1`.
///
/// The policy only computes delays. Enforcing an attempt ceiling is the
/// caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Creates a policy. A `base` above `cap` makes every delay equal `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Returns the base delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Returns the cap.
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Calculates the delay for a consecutive failure count.
    ///
    /// A count of zero means "attempt immediately".
    pub fn delay(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::ZERO;
        }

        let exponent = failure_count - 1;
        let scaled = if exponent >= 64 {
            None
        } else {
            self.base
                .as_nanos()
                .checked_mul(1u128 << exponent)
        };

        match scaled {
            Some(nanos) if nanos <= self.cap.as_nanos() => duration_from_nanos(nanos),
            _ => self.cap,
        }
    }
}

fn duration_from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = (nanos / NANOS_PER_SEC).min(u128::from(u64::MAX)) as u64;
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// Consecutive-failure bookkeeping for one supervisor.
///
/// The delay never decreases while failures persist and resets to zero on
/// any success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    failures: u32,
    delay: Duration,
}

impl BackoffState {
    /// Creates a cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consecutive failures.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The delay computed for the latest failure.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay = self.delay.max(policy.delay(self.failures));
        self.delay
    }

    /// Clears the failure count.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = Duration::ZERO;
    }
}
