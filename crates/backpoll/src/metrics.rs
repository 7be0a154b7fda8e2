//! Polling system metrics.
//!
//! [`PollingMetrics`] provides lock-free atomic counters for the poll
//! loop and the delivery path. Counters are updated from both the loop
//! task and the queue's signal callbacks, so all accesses are relaxed
//! atomics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for polling system statistics.
#[derive(Debug, Default)]
pub struct PollingMetrics {
    /// Total invocations of the poll function.
    pub polls: AtomicU64,
    /// Total results accepted into the delivery queue.
    pub deliveries: AtomicU64,
    /// Total results the native runtime failed to resolve.
    pub undeliverable: AtomicU64,
    /// Total results discarded by the queue after finish/abandon.
    pub dropped: AtomicU64,
    /// Times the queue signalled the high watermark.
    pub pauses: AtomicU64,
    /// Times the parked loop was resumed by consumer demand.
    pub resumes: AtomicU64,
}

impl PollingMetrics {
    /// Creates a metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation of the poll function.
    pub(crate) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a result accepted by the queue.
    pub(crate) fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a result the native runtime could not resolve.
    pub(crate) fn record_undeliverable(&self) {
        self.undeliverable.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a push discarded by the queue.
    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a high-watermark pause signal.
    pub(crate) fn record_pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a resume of the parked poll loop.
    pub(crate) fn record_resume(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }
}
