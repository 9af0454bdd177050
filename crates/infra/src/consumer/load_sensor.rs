//! In-flight record accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Counts records currently being handled against a ceiling.
///
/// One sensor is shared by every consumer of the process (the global budget);
/// each consumer also keeps a private one for its own load limit. Capacity is
/// reserved before fetching, so the count can never exceed the limit.
#[derive(Debug)]
pub struct LoadSensor {
    limit: usize,
    in_flight: AtomicUsize,
    released: Notify,
}

impl LoadSensor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.in_flight())
    }

    /// Reserve up to `wanted` slots; returns how many were reserved (maybe 0).
    pub fn try_acquire_up_to(&self, wanted: usize) -> usize {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            let granted = wanted.min(self.limit.saturating_sub(current));
            if granted == 0 {
                return 0;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back `count` slots and wake everyone waiting for capacity.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self.in_flight.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(previous >= count, "released more load than was acquired");
        self.released.notify_waiters();
    }

    /// Resolves on the next release. Create it before checking headroom so a
    /// release in between is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }
}

/// One record's share of the local and global budgets, released on drop.
///
/// Dropping happens on every exit from a handler task, including a panic, so
/// capacity cannot leak.
#[derive(Debug)]
pub struct LoadPermit {
    local: Arc<LoadSensor>,
    global: Arc<LoadSensor>,
}

impl LoadPermit {
    /// Wrap one slot already reserved on both sensors.
    pub(crate) fn reserved(local: Arc<LoadSensor>, global: Arc<LoadSensor>) -> Self {
        Self { local, global }
    }
}

impl Drop for LoadPermit {
    fn drop(&mut self) {
        self.global.release(1);
        self.local.release(1);
    }
}
