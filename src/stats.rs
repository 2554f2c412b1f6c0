//! Event accounting.
//!
//! Counters are bumped from both task and interrupt context, so they are
//! plain relaxed atomics; a snapshot is only approximately consistent.

use portable_atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub struct Stats {
    posted: AtomicU32,
    posted_pending: AtomicU32,
    dispatched: AtomicU32,
    unhandled: AtomicU32,
    dropped_full: AtomicU32,
    dropped_inactive: AtomicU32,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatsSnapshot {
    /// Events queued from task context.
    pub posted: u32,
    /// Events queued through the interrupt-safe path.
    pub posted_pending: u32,
    /// Events handed to a machine, including instant ones.
    pub dispatched: u32,
    /// Events no state in the hierarchy handled.
    pub unhandled: u32,
    /// Events rejected because the target ring was full.
    pub dropped_full: u32,
    /// Queued events discarded because their target was inactive.
    pub dropped_inactive: u32,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            posted: AtomicU32::new(0),
            posted_pending: AtomicU32::new(0),
            dispatched: AtomicU32::new(0),
            unhandled: AtomicU32::new(0),
            dropped_full: AtomicU32::new(0),
            dropped_inactive: AtomicU32::new(0),
        }
    }

    pub(crate) fn record_posted(&self, from_interrupt: bool) {
        if from_interrupt {
            self.posted_pending.fetch_add(1, Ordering::Relaxed);
        } else {
            self.posted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_full(&self) {
        self.dropped_full.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_inactive(&self) {
        self.dropped_inactive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            posted: self.posted.load(Ordering::Relaxed),
            posted_pending: self.posted_pending.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_inactive: self.dropped_inactive.load(Ordering::Relaxed),
        }
    }
}
