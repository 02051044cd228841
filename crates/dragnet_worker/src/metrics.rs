//! In-process worker metrics.
//!
//! Lock-free counters with a single global instance; the CLI's `metrics`
//! command combines these with the store-derived gauges.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub primary_claimed: AtomicU64,
    pub primary_completed: AtomicU64,
    pub primary_failed: AtomicU64,
    pub ancillary_claimed: AtomicU64,
    pub ancillary_completed: AtomicU64,
    pub ancillary_failed: AtomicU64,
    pub discoveries: AtomicU64,
    pub followups_enqueued: AtomicU64,
    pub heartbeats: AtomicU64,
    pub sweeps: AtomicU64,
    pub store_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            primary_claimed: AtomicU64::new(0),
            primary_completed: AtomicU64::new(0),
            primary_failed: AtomicU64::new(0),
            ancillary_claimed: AtomicU64::new(0),
            ancillary_completed: AtomicU64::new(0),
            ancillary_failed: AtomicU64::new(0),
            discoveries: AtomicU64::new(0),
            followups_enqueued: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            primary_claimed: self.primary_claimed.load(Ordering::Relaxed),
            primary_completed: self.primary_completed.load(Ordering::Relaxed),
            primary_failed: self.primary_failed.load(Ordering::Relaxed),
            ancillary_claimed: self.ancillary_claimed.load(Ordering::Relaxed),
            ancillary_completed: self.ancillary_completed.load(Ordering::Relaxed),
            ancillary_failed: self.ancillary_failed.load(Ordering::Relaxed),
            discoveries: self.discoveries.load(Ordering::Relaxed),
            followups_enqueued: self.followups_enqueued.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot for reporting.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub primary_claimed: u64,
    pub primary_completed: u64,
    pub primary_failed: u64,
    pub ancillary_claimed: u64,
    pub ancillary_completed: u64,
    pub ancillary_failed: u64,
    pub discoveries: u64,
    pub followups_enqueued: u64,
    pub heartbeats: u64,
    pub sweeps: u64,
    pub store_errors: u64,
}

impl MetricsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Primary: {} claimed, {} completed, {} failed | \
             Ancillary: {} claimed, {} completed, {} failed | \
             {} discoveries, {} follow-ups",
            self.primary_claimed,
            self.primary_completed,
            self.primary_failed,
            self.ancillary_claimed,
            self.ancillary_completed,
            self.ancillary_failed,
            self.discoveries,
            self.followups_enqueued,
        )
    }
}
