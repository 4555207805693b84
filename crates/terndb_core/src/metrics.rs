//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments the counter.
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// The current count.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters exposed by a [`Db`](crate::Db).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Read transactions started.
    pub reads_started: Counter,
    /// Write transactions started.
    pub writes_started: Counter,
    /// Write transactions committed.
    pub commits: Counter,
    /// Write transactions rolled back.
    pub rollbacks: Counter,
    /// Object accessor cache refreshes.
    pub accessor_refreshes: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_bumps() {
        let counter = Counter::default();
        assert_eq!(counter.get(), 0);
        counter.bump();
        counter.bump();
        assert_eq!(counter.get(), 2);
    }
}
