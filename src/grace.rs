/// The RCU grace period primitive, supplied by the surrounding RCU flavor.
///
/// Contract: when [`wait_for_grace_period`](GracePeriod::wait_for_grace_period)
/// returns, every RCU read-side critical section that began before the
/// call has completed. The engine treats the wait as expensive and calls
/// it at most once per barrier pass, no matter how many callbacks that
/// pass retires.
///
/// Any `Fn() + Send + Sync` closure implements the trait, which keeps
/// stubbing trivial in tests and benchmarks:
///
/// ```
/// use rcu_defer::{DeferEngine, GracePeriod};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let waits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&waits);
/// let engine = DeferEngine::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
/// engine.barrier(); // nothing pending: the stub is not called
/// assert_eq!(waits.load(Ordering::SeqCst), 0);
/// ```
pub trait GracePeriod: Send + Sync {
    /// Blocks until all pre-existing RCU readers have completed.
    fn wait_for_grace_period(&self);
}

impl<F> GracePeriod for F
where
    F: Fn() + Send + Sync,
{
    fn wait_for_grace_period(&self) {
        self();
    }
}
