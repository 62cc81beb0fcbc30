use crate::grace::GracePeriod;
use crate::metrics::Metrics;
use crate::queue::DeferQueue;
use crate::registry::Registry;
use crate::slot;
use crate::wake::WakeChannel;
use crate::{Config, MetricsSnapshot};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// A deferred callback: invoked with its argument once a grace period has
/// elapsed since it was enqueued.
///
/// Must point at a function aligned to at least 2 bytes (every function on
/// supported targets; misaligned pointers still round-trip, at the cost of
/// the escape encoding).
pub type DeferFn = unsafe fn(*mut ());

/// Error types for engine operations.
#[derive(Debug, Error)]
pub enum DeferError {
    /// The reclamation thread could not be spawned.
    #[error("failed to spawn the reclamation thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Batched deferred reclamation engine.
///
/// Producers register to obtain a [`Deferrer`] bound to a dedicated ring,
/// then enqueue `(callback, argument)` pairs with
/// [`defer`](Deferrer::defer). A background reclamation thread wakes when
/// nudged, lets arrivals coalesce, and runs one barrier pass: a single
/// grace-period wait amortized over every callback queued at snapshot
/// time, followed by a drain of every ring.
///
/// Cloning is cheap and shares the same engine; the reclamation thread
/// runs while at least one `Deferrer` is alive.
pub struct DeferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    /// Defer mutex (inner): registry membership, every queue's tail, and
    /// barrier passes.
    registry: Mutex<Registry>,
    /// Reclamation thread mutex (outer): start/stop of the thread and
    /// register/unregister transitions. Always taken before `registry`.
    worker: Mutex<WorkerState>,
    wake: WakeChannel,
    /// Cooperative cancellation for the reclamation thread.
    cancel: AtomicBool,
    grace: Box<dyn GracePeriod>,
    metrics: Metrics,
    config: Config,
}

struct WorkerState {
    handle: Option<JoinHandle<()>>,
}

impl DeferEngine {
    /// Creates an engine with the default configuration.
    pub fn new(grace: impl GracePeriod + 'static) -> Self {
        Self::with_config(Config::default(), grace)
    }

    /// Creates an engine with a custom configuration.
    pub fn with_config(config: Config, grace: impl GracePeriod + 'static) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: Mutex::new(Registry::new()),
                worker: Mutex::new(WorkerState { handle: None }),
                wake: WakeChannel::new(),
                cancel: AtomicBool::new(false),
                grace: Box::new(grace),
                metrics: Metrics::new(),
                config,
            }),
        }
    }

    /// Registers the caller as a deferrer, allocating its ring.
    ///
    /// The first registration starts the reclamation thread; the handle's
    /// drop drains the ring, deregisters it, and stops the thread when the
    /// last deferrer leaves.
    pub fn register(&self) -> Result<Deferrer, DeferError> {
        let mut worker = self.inner.worker.lock().expect("worker mutex poisoned");

        let queue = Arc::new(DeferQueue::new(self.inner.config));
        self.inner
            .registry
            .lock()
            .expect("defer mutex poisoned")
            .add(Arc::clone(&queue));

        if worker.handle.is_none() {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name("rcu-defer-reclaim".into())
                .spawn(move || reclaim_loop(&inner));

            match spawned {
                Ok(handle) => worker.handle = Some(handle),
                Err(err) => {
                    self.inner
                        .registry
                        .lock()
                        .expect("defer mutex poisoned")
                        .remove(&queue);
                    return Err(err.into());
                }
            }
        }

        Ok(Deferrer {
            inner: Arc::clone(&self.inner),
            queue,
            last_fct_in: 0,
        })
    }

    /// Runs a global barrier pass: every callback queued as of entry is
    /// invoked before this returns, at the cost of at most one grace
    /// period. Callbacks enqueued concurrently may be left for the next
    /// pass unless the enqueue happens-before this call.
    pub fn barrier(&self) {
        self.inner.barrier_all();
    }

    /// Returns a metrics snapshot (all zeros unless
    /// [`Config::enable_metrics`] is set).
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl Clone for DeferEngine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for DeferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    /// Global barrier pass. One grace-period wait covers every callback
    /// present at snapshot time; zero pending slots means the grace
    /// primitive is not touched at all.
    fn barrier_all(&self) {
        let mut registry = self.registry.lock().expect("defer mutex poisoned");

        let pending = registry.snapshot_heads();
        if pending == 0 {
            return;
        }

        self.grace.wait_for_grace_period();
        if self.config.enable_metrics {
            self.metrics.add_grace_waits(1);
        }

        let mut invoked = 0;
        for entry in registry.entries() {
            invoked += entry.queue.drain_up_to(entry.last_head);
        }

        if self.config.enable_metrics {
            self.metrics.add_barrier_passes(1);
            self.metrics.add_callbacks_invoked(invoked);
        }
    }

    /// Local barrier pass for one queue.
    fn barrier_queue(&self, queue: &DeferQueue) {
        let registry = self.registry.lock().expect("defer mutex poisoned");
        self.drain_queue_locked(&registry, queue);
    }

    /// Drains `queue` to its current head. The `_registry` parameter
    /// witnesses that the caller holds the defer mutex.
    fn drain_queue_locked(&self, _registry: &Registry, queue: &DeferQueue) {
        let head = queue.head_acquire();
        if head == queue.tail() {
            return;
        }

        self.grace.wait_for_grace_period();
        let invoked = queue.drain_up_to(head);

        if self.config.enable_metrics {
            self.metrics.add_grace_waits(1);
            self.metrics.add_barrier_passes(1);
            self.metrics.add_callbacks_invoked(invoked);
        }
    }

    fn pending_slots(&self) -> u64 {
        self.registry
            .lock()
            .expect("defer mutex poisoned")
            .pending_slots()
    }

    /// Coalescing sleep, chunked so a stop request never waits out the
    /// full delay before the thread can exit.
    fn sleep_coalesce(&self) {
        const STEP: Duration = Duration::from_millis(10);

        let mut remaining = self.config.coalesce_delay;
        while !remaining.is_zero() && !self.cancel.load(Ordering::Acquire) {
            let step = remaining.min(STEP);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

/// Reclamation thread body: sleep on the wake channel, coalesce, run a
/// barrier pass, repeat until cancelled.
fn reclaim_loop(inner: &EngineInner) {
    loop {
        if inner.cancel.load(Ordering::Acquire) {
            break;
        }

        inner.wake.prepare_wait();
        // Re-check between announcing the wait and blocking: a producer
        // that published before our -1 store became visible is caught
        // here rather than slept through.
        if inner.cancel.load(Ordering::SeqCst) || inner.pending_slots() > 0 {
            inner.wake.cancel_wait();
        } else {
            inner.wake.block();
        }

        // Let producers batch more callbacks into this pass.
        inner.sleep_coalesce();
        if inner.cancel.load(Ordering::Acquire) {
            break;
        }

        inner.barrier_all();
    }
}

/// Producer handle: the registered thread's side of its defer queue.
///
/// Holding the handle by value is what enforces the single-writer ring
/// discipline, so `Deferrer` is deliberately not `Clone`. The handle is
/// `Send`: moving it to another thread moves the producer role with it.
pub struct Deferrer {
    inner: Arc<EngineInner>,
    queue: Arc<DeferQueue>,
    /// Most recent function pointer encoded into the ring; lets bursts of
    /// the same callback collapse to single-slot records.
    last_fct_in: usize,
}

impl Deferrer {
    /// Enqueues `fct` to be called with `arg` after a grace period.
    ///
    /// Never fails. If the ring is near full this synchronously drains it
    /// first, which blocks for one grace period. Otherwise the cost is a
    /// few slot writes plus a conditional nudge of the reclamation thread.
    ///
    /// # Safety
    ///
    /// - `arg` must be valid for whatever `fct` does with it at any point
    ///   after this call, on any thread.
    /// - `fct` may run on the reclamation thread, the thread of any caller
    ///   of [`DeferEngine::barrier`], or this thread (self-drain).
    /// - `fct` must not re-enter the engine (no `defer`, `barrier`, or
    ///   `flush`) and must not unwind.
    pub unsafe fn defer(&mut self, fct: DeferFn, arg: *mut ()) {
        if self.queue.needs_self_drain() {
            if self.inner.config.enable_metrics {
                self.inner.metrics.add_self_drains(1);
            }
            self.inner.barrier_queue(&self.queue);
        }

        let record = slot::encode(fct as usize, arg as usize, &mut self.last_fct_in);
        self.queue.push_record(&record);

        if self.inner.config.enable_metrics {
            self.inner.metrics.add_callbacks_deferred(1);
        }

        // Queue published; nudge the reclamation thread if it is asleep.
        if self.inner.wake.post() && self.inner.config.enable_metrics {
            self.inner.metrics.add_wake_posts(1);
        }
    }

    /// Drains only this handle's queue, blocking for one grace period if
    /// it is non-empty.
    pub fn flush(&self) {
        self.inner.barrier_queue(&self.queue);
    }

    /// Number of slots currently queued (a callback occupies 1 to 3 slots
    /// depending on its record shape).
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for Deferrer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferrer")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Drop for Deferrer {
    /// Drains and deregisters the queue; the last deferrer out also stops
    /// the reclamation thread.
    fn drop(&mut self) {
        let mut worker = self.inner.worker.lock().expect("worker mutex poisoned");

        let now_empty = {
            let mut registry = self.inner.registry.lock().expect("defer mutex poisoned");
            self.inner.drain_queue_locked(&registry, &self.queue);
            registry.remove(&self.queue);
            registry.is_empty()
        };

        if now_empty {
            if let Some(handle) = worker.handle.take() {
                self.inner.cancel.store(true, Ordering::Release);
                self.inner.wake.force_post();
                // A panicked reclamation thread has nothing left to
                // salvage; joining the Err here would only double-panic
                // during drop.
                let _ = handle.join();
                self.inner.cancel.store(false, Ordering::Release);
            }
        }
    }
}
