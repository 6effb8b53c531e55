//! §4.1 RateMeter: sliding one-second rate and monotonic total for a stream.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe byte counter with an exponentially smoothed one-second rate.
///
/// `record()` may be called from a worker thread; `tick()` must only be
/// called from the event-loop thread once a second.
#[derive(Debug, Default)]
pub struct RateMeter {
    total: AtomicU64,
    /// bytes recorded since the last tick, reset to zero on tick()
    pending: AtomicU64,
    /// the smoothed rate, in bytes/second, as of the last tick()
    rate: AtomicU64,
}

impl RateMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account `bytes` transferred. Safe to call from any thread.
    pub fn record(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
        self.pending.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Advance the meter by one second. Weight 0.5 is applied to the
    /// difference between the new bytes-this-second and the previous rate.
    pub fn tick(&self) {
        let new_bytes = self.pending.swap(0, Ordering::Relaxed) as f64;
        let old_rate = self.rate.load(Ordering::Relaxed) as f64;
        let smoothed = old_rate + 0.5 * (new_bytes - old_rate);
        self.rate.store(smoothed.max(0.0) as u64, Ordering::Relaxed);
    }

    /// The current smoothed rate, in bytes/second.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Total bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// The two global meters aggregating all ingress/egress across every
/// endpoint. Per-endpoint meters are reported separately and must not be
/// summed into these (spec.md §4.1).
#[derive(Debug, Default)]
pub struct GlobalRates {
    pub upload: RateMeter,
    pub download: RateMeter,
}

impl GlobalRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) {
        self.upload.tick();
        self.download.tick();
    }
}
