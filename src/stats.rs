//! Dispatcher statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-consumer-group delivery statistics
pub struct DispatcherStats {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub duplicate_events: AtomicU64,
    pub retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub schema_rejections: AtomicU64,
    /// Events with no registered handler
    pub events_skipped: AtomicU64,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
            duplicate_events: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            schema_rejections: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            schema_rejections: self.schema_rejections.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
        }
    }
}

impl Default for DispatcherStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub events_received: u64,
    pub events_processed: u64,
    pub duplicate_events: u64,
    pub retries: u64,
    pub dead_lettered: u64,
    pub schema_rejections: u64,
    pub events_skipped: u64,
}
