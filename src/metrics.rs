//! Process-wide counters for the decision core.
//!
//! Every drop, rejection and veto increments one of these; nothing is lost
//! without a count.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CoreCounters {
    pub published: AtomicU64,
    pub malformed: AtomicU64,
    pub out_of_order: AtomicU64,
    pub saturated: AtomicU64,
    pub dropped_out_of_order: AtomicU64,
    pub duplicate_add: AtomicU64,
    pub absent_remove: AtomicU64,
    pub expired: AtomicU64,
    pub matches: AtomicU64,
    pub intents: AtomicU64,
    pub vetoes: AtomicU64,
    pub regime_rejected: AtomicU64,
    pub journal_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub published: u64,
    pub malformed: u64,
    pub out_of_order: u64,
    pub saturated: u64,
    pub dropped_out_of_order: u64,
    pub duplicate_add: u64,
    pub absent_remove: u64,
    pub expired: u64,
    pub matches: u64,
    pub intents: u64,
    pub vetoes: u64,
    pub regime_rejected: u64,
    pub journal_dropped: u64,
}

impl CoreCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            published: get(&self.published),
            malformed: get(&self.malformed),
            out_of_order: get(&self.out_of_order),
            saturated: get(&self.saturated),
            dropped_out_of_order: get(&self.dropped_out_of_order),
            duplicate_add: get(&self.duplicate_add),
            absent_remove: get(&self.absent_remove),
            expired: get(&self.expired),
            matches: get(&self.matches),
            intents: get(&self.intents),
            vetoes: get(&self.vetoes),
            regime_rejected: get(&self.regime_rejected),
            journal_dropped: get(&self.journal_dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let c = CoreCounters::new();
        CoreCounters::incr(&c.malformed);
        CoreCounters::incr(&c.malformed);
        CoreCounters::incr(&c.vetoes);
        let s = c.snapshot();
        assert_eq!(s.malformed, 2);
        assert_eq!(s.vetoes, 1);
        assert_eq!(s.intents, 0);
    }
}
