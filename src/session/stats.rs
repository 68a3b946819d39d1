//! Per-session usage counters
//!
//! `total` only grows. `current` counts the running five-minute window and
//! `mins5` holds the previous one; both move only on `roll_over`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct UsageCounter {
    total: AtomicU64,
    current: AtomicU64,
    mins5: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub total: u64,
    pub current: u64,
    pub mins5: u64,
}

impl UsageCounter {
    pub fn inc(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn roll_over(&self) {
        let current = self.current.swap(0, Ordering::Relaxed);
        self.mins5.store(current, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            total: self.total.load(Ordering::Relaxed),
            current: self.current.load(Ordering::Relaxed),
            mins5: self.mins5.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub find: UsageCounter,
    pub tx: UsageCounter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub find: UsageSnapshot,
    pub tx: UsageSnapshot,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roll_over(&self) {
        self.find.roll_over();
        self.tx.roll_over();
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            find: self.find.snapshot(),
            tx: self.tx.snapshot(),
        }
    }
}

#[cfg(test)]
mod stats_tests {
    use super::*;

    #[test]
    fn test_counters_monotonic_until_roll_over() {
        let stats = SessionStats::new();
        stats.find.inc();
        stats.find.inc();
        stats.tx.inc();

        let s = stats.snapshot();
        assert_eq!(s.find, UsageSnapshot { total: 2, current: 2, mins5: 0 });
        assert_eq!(s.tx.total, 1);

        stats.roll_over();
        stats.find.inc();
        let s = stats.snapshot();
        assert_eq!(s.find, UsageSnapshot { total: 3, current: 1, mins5: 2 });
        assert_eq!(s.tx, UsageSnapshot { total: 1, current: 0, mins5: 1 });
    }
}
