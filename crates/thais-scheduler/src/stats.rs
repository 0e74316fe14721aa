use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the dispatch loop and every handle
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub(crate) scheduled: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) fired: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) observer_panics: AtomicU64,
    pub(crate) cycles: AtomicU64,
}

impl SchedulerStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            observer_panics: self.observer_panics.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scheduled: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub fired: u64,
    pub faults: u64,
    /// Observer calls that panicked and were skipped
    pub observer_panics: u64,
    pub cycles: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scheduled: {} | Rejected: {} | Cancelled: {} | Fired: {} | Faults: {} | Observer panics: {} | Cycles: {}",
            self.scheduled,
            self.rejected,
            self.cancelled,
            self.fired,
            self.faults,
            self.observer_panics,
            self.cycles
        )
    }
}
