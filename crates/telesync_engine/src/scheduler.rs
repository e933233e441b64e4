//! Adaptive poll cadence.

use crate::config::EndpointConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One measured round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Duration of the completed operation.
    pub latency: Duration,
    /// When the operation completed.
    pub completed_at: Instant,
}

/// Latency band selected by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Band {
    /// Below the fast threshold.
    Fast,
    /// Below the moderate threshold.
    Moderate,
    /// At or above the moderate threshold.
    Slow,
    /// Too many consecutive failures; latency is ignored.
    Degraded,
}

/// Thresholds and intervals used by [`AdaptiveScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Latencies below this are fast.
    pub fast_band: Duration,
    /// Latencies below this are moderate.
    pub moderate_band: Duration,
    /// Interval for the fast band.
    pub fast_interval: Duration,
    /// Interval for the moderate band.
    pub moderate_interval: Duration,
    /// Interval for the slow band.
    pub slow_interval: Duration,
    /// Interval while degraded.
    pub degraded_interval: Duration,
    /// Failure count above which the scheduler is degraded.
    pub degraded_after_failures: u32,
    /// Ring size for recent samples.
    pub capacity: usize,
}

impl From<&EndpointConfig> for SchedulerConfig {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            fast_band: config.fast_band,
            moderate_band: config.moderate_band,
            fast_interval: config.min_poll_interval,
            moderate_interval: config.base_poll_interval,
            slow_interval: config.max_poll_interval,
            degraded_interval: config.degraded_poll_interval,
            degraded_after_failures: config.degraded_after_failures,
            capacity: config.latency_samples.max(1),
        }
    }
}

/// Chooses the delay before the next steady-state synchronization.
///
/// Fast responses earn short intervals and slow ones long intervals, so the
/// poll rate follows backend capacity. Reconnection delays are not decided
/// here; see [`BackoffPolicy`](crate::BackoffPolicy).
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    samples: VecDeque<Sample>,
}

impl AdaptiveScheduler {
    /// Creates a scheduler with no samples.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.capacity),
            config,
        }
    }

    /// Records a successful operation's latency, evicting the oldest sample
    /// when the ring is full.
    pub fn record(&mut self, sample: Sample) {
        if self.samples.len() == self.config.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Returns the most recent sample.
    pub fn last_sample(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Returns the number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Mean latency over the retained samples.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        Some(total / self.samples.len() as u32)
    }

    /// Classifies a latency into a healthy band.
    pub fn classify(&self, latency: Duration) -> Band {
        if latency < self.config.fast_band {
            Band::Fast
        } else if latency < self.config.moderate_band {
            Band::Moderate
        } else {
            Band::Slow
        }
    }

    /// Returns the band that applies given the consecutive failure count.
    ///
    /// With no samples yet the moderate band is assumed.
    pub fn band(&self, consecutive_failures: u32) -> Band {
        if consecutive_failures > self.config.degraded_after_failures {
            return Band::Degraded;
        }
        match self.samples.back() {
            Some(sample) => self.classify(sample.latency),
            None => Band::Moderate,
        }
    }

    /// Returns the interval configured for a band.
    pub fn interval_for(&self, band: Band) -> Duration {
        match band {
            Band::Fast => self.config.fast_interval,
            Band::Moderate => self.config.moderate_interval,
            Band::Slow => self.config.slow_interval,
            Band::Degraded => self.config.degraded_interval,
        }
    }

    /// Returns the delay before the next synchronization.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        self.interval_for(self.band(consecutive_failures))
    }
}
