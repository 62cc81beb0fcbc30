use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for engine activity.
///
/// Collection is gated by [`Config::enable_metrics`](crate::Config); all
/// counters use relaxed ordering since they are monitoring data, not
/// synchronization.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    callbacks_deferred: AtomicU64,
    callbacks_invoked: AtomicU64,
    barrier_passes: AtomicU64,
    grace_waits: AtomicU64,
    self_drains: AtomicU64,
    wake_posts: AtomicU64,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_callbacks_deferred(&self, n: u64) {
        self.callbacks_deferred.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_callbacks_invoked(&self, n: u64) {
        self.callbacks_invoked.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_barrier_passes(&self, n: u64) {
        self.barrier_passes.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_grace_waits(&self, n: u64) {
        self.grace_waits.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_self_drains(&self, n: u64) {
        self.self_drains.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_wake_posts(&self, n: u64) {
        self.wake_posts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            callbacks_deferred: self.callbacks_deferred.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            barrier_passes: self.barrier_passes.load(Ordering::Relaxed),
            grace_waits: self.grace_waits.load(Ordering::Relaxed),
            self_drains: self.self_drains.load(Ordering::Relaxed),
            wake_posts: self.wake_posts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Callbacks enqueued through [`Deferrer::defer`](crate::Deferrer::defer).
    pub callbacks_deferred: u64,
    /// Callbacks actually invoked after a grace period.
    pub callbacks_invoked: u64,
    /// Barrier passes that ran (global and per-thread).
    pub barrier_passes: u64,
    /// Calls into the grace period primitive.
    pub grace_waits: u64,
    /// Synchronous drains triggered by a near-full ring.
    pub self_drains: u64,
    /// Wake-ups posted to the reclamation thread.
    pub wake_posts: u64,
}
