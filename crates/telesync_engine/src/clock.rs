//! Injectable time source.
//!
//! Every delay the engine waits on is requested through [`Clock::after`], so
//! tests can swap in a [`ManualClock`] and advance virtual time
//! deterministically instead of sleeping.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A one-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Source of timestamps and one-shot timers.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Runs `callback` once after `delay`, unless the returned handle is
    /// cancelled first. Never blocks the caller.
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Handle to a scheduled timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Cancels the timer. Idempotent; a timer that already fired is unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Returns true if [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wall-clock timers backed by the tokio runtime.
///
/// `after` must be called from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl TokioClock {
    /// Creates a new tokio clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                callback();
            }
        });
        TimerHandle::new(cancelled, Some(task.abort_handle()))
    }
}

struct ManualTimer {
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    timers: BTreeMap<(Duration, u64), ManualTimer>,
}

/// Virtual time for deterministic tests.
///
/// Time only moves when [`advance`](Self::advance) is called. Due timers fire
/// in deadline order, ties in scheduling order. Callbacks run on the caller's
/// thread with no internal lock held, so they may schedule further timers.
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// Creates a clock at virtual time zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_seq: 0,
                timers: BTreeMap::new(),
            }),
        }
    }

    /// Returns the virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Moves virtual time forward, firing every timer that comes due.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().elapsed + by;
        loop {
            let due = {
                let mut state = self.state.lock();
                let first = state.timers.keys().next().copied();
                match first {
                    Some(key) if key.0 <= target => {
                        state.elapsed = state.elapsed.max(key.0);
                        state.timers.remove(&key)
                    }
                    _ => {
                        state.elapsed = target;
                        None
                    }
                }
            };
            match due {
                Some(timer) => {
                    if !timer.cancelled.load(Ordering::SeqCst) {
                        (timer.callback)();
                    }
                }
                None => break,
            }
        }
    }

    /// Advances to the next live timer deadline and fires it.
    ///
    /// Returns the delay that was skipped, or `None` if nothing is pending.
    pub fn advance_to_next(&self) -> Option<Duration> {
        let (now, next) = {
            let state = self.state.lock();
            (state.elapsed, Self::next_live(&state))
        };
        let next = next?;
        let delay = next.saturating_sub(now);
        self.advance(delay);
        Some(delay)
    }

    /// Returns the number of timers that are scheduled and not cancelled.
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .values()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Returns the delay until the next live timer, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        let state = self.state.lock();
        Self::next_live(&state).map(|deadline| deadline.saturating_sub(state.elapsed))
    }

    fn next_live(state: &ManualState) -> Option<Duration> {
        state
            .timers
            .iter()
            .find(|(_, t)| !t.cancelled.load(Ordering::SeqCst))
            .map(|((deadline, _), _)| *deadline)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let deadline = state.elapsed + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.insert(
            (deadline, seq),
            ManualTimer {
                cancelled: Arc::clone(&cancelled),
                callback,
            },
        );
        TimerHandle::new(cancelled, None)
    }
}
