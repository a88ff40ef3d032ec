//! Uplink counters.

use crate::event::DropReason;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for processed and dropped frames.
#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    processed: AtomicU64,
    dropped: [AtomicU64; DropReason::ALL.len()],
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub dropped: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }

    pub fn dropped_for(&self, reason: DropReason) -> u64 {
        self.dropped.get(reason.as_str()).copied().unwrap_or(0)
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let dropped = DropReason::ALL
            .iter()
            .map(|r| {
                (
                    r.as_str().to_string(),
                    self.dropped[r.index()].load(Ordering::Relaxed),
                )
            })
            .collect();
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_reason() {
        let stats = DispatchStats::new();
        stats.record_received();
        stats.record_received();
        stats.record_processed();
        stats.record_dropped(DropReason::MalformedPayload);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.dropped_for(DropReason::MalformedPayload), 1);
        assert_eq!(snap.dropped_for(DropReason::QueueFull), 0);
        assert_eq!(snap.dropped_total(), 1);
    }
}
