//! At-most-one-in-flight request guard.
//!
//! The guard hands out at most one [`OperationId`] at a time. A leaked
//! acquisition cannot block synchronization forever: once the holder exceeds
//! the safety timeout the guard force-releases it, either when the safety
//! timer fires ([`RequestGuard::expire`]) or lazily on the next
//! [`RequestGuard::try_acquire`].

use crate::clock::{Clock, TimerHandle};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of one guarded synchronization operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Returns the raw sequence number.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// The single in-flight operation.
#[derive(Debug)]
pub struct PendingOperation {
    id: OperationId,
    started_at: Instant,
    safety_timer: TimerHandle,
}

impl PendingOperation {
    /// The operation id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// When the operation was acquired.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// A stale operation the guard released on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleOperation {
    /// The released operation.
    pub id: OperationId,
    /// How long it had been held.
    pub held_for: Duration,
}

/// A granted acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// The new operation.
    pub id: OperationId,
    /// Set when a stale holder had to be force-released first.
    pub replaced: Option<StaleOperation>,
}

/// A refused acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refused {
    /// The operation currently holding the guard.
    pub holder: OperationId,
    /// How long it has been held.
    pub held_for: Duration,
}

/// Enforces at most one in-flight operation.
pub struct RequestGuard {
    clock: Arc<dyn Clock>,
    safety_timeout: Duration,
    next_id: u64,
    pending: Option<PendingOperation>,
}

impl RequestGuard {
    /// Creates an idle guard.
    pub fn new(clock: Arc<dyn Clock>, safety_timeout: Duration) -> Self {
        Self {
            clock,
            safety_timeout,
            next_id: 1,
            pending: None,
        }
    }

    /// Returns the safety timeout.
    pub fn safety_timeout(&self) -> Duration {
        self.safety_timeout
    }

    /// Returns true if an operation is in flight.
    pub fn is_held(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns the in-flight operation, if any.
    pub fn pending(&self) -> Option<&PendingOperation> {
        self.pending.as_ref()
    }

    /// Tries to start a new operation.
    ///
    /// `on_expire` runs (via the clock) if the new operation is still held
    /// when the safety timeout elapses; it should route back to
    /// [`expire`](Self::expire).
    pub fn try_acquire<F>(&mut self, on_expire: F) -> Result<Acquired, Refused>
    where
        F: FnOnce(OperationId) + Send + 'static,
    {
        let now = self.clock.now();
        let mut replaced = None;

        if let Some(current) = &self.pending {
            let held_for = now.saturating_duration_since(current.started_at);
            if held_for < self.safety_timeout {
                return Err(Refused {
                    holder: current.id,
                    held_for,
                });
            }
            let stale_id = current.id;
            self.clear();
            replaced = Some(StaleOperation {
                id: stale_id,
                held_for,
            });
        }

        let id = OperationId(self.next_id);
        self.next_id += 1;
        let safety_timer = self
            .clock
            .after(self.safety_timeout, Box::new(move || on_expire(id)));
        self.pending = Some(PendingOperation {
            id,
            started_at: now,
            safety_timer,
        });

        Ok(Acquired { id, replaced })
    }

    /// Releases `id` and returns how long it was held.
    ///
    /// Releasing an operation that is no longer the holder (for example one
    /// that was already force-released) is a no-op returning `None`.
    pub fn release(&mut self, id: OperationId) -> Option<Duration> {
        match &self.pending {
            Some(current) if current.id == id => {
                let held_for = self
                    .clock
                    .now()
                    .saturating_duration_since(current.started_at);
                self.clear();
                Some(held_for)
            }
            _ => None,
        }
    }

    /// Force-releases `id` if it is still the holder. Called when its safety
    /// timer fires.
    pub fn expire(&mut self, id: OperationId) -> Option<StaleOperation> {
        self.release(id).map(|held_for| StaleOperation { id, held_for })
    }

    /// Drops any in-flight operation without reporting it.
    pub fn clear(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.safety_timer.cancel();
        }
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("safety_timeout", &self.safety_timeout)
            .field("pending", &self.pending)
            .finish()
    }
}
