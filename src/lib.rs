//! Batched deferred reclamation for userspace RCU.
//!
//! Writers in an RCU scheme cannot free a node the moment they unlink it:
//! a reader that started before the unlink may still hold a reference.
//! This crate lets any number of producer threads enqueue *deferred
//! callbacks* (a function pointer plus an opaque argument) into
//! per-thread rings, and guarantees each callback runs only after a
//! grace period has elapsed since it was enqueued.
//!
//! The expensive primitive, the grace-period wait, is amortized: a
//! background reclamation thread snapshots every ring, waits once, and
//! drains everything queued at snapshot time in a single barrier pass.
//!
//! # Key design points
//!
//! - Per-producer SPSC rings with monotonic `u64` sequence numbers; no
//!   producer-producer contention on the hot path.
//! - A compact slot encoding that stores function and argument pointers
//!   in the same ring, suppressing repeated function-pointer writes for
//!   bursts of identical callbacks.
//! - A one-word futex-style wake channel so producers can nudge the
//!   reclamation thread without syscalls in the common case.
//! - One grace-period wait per barrier pass, zero when nothing is
//!   pending.
//!
//! # Example
//!
//! ```
//! use rcu_defer::DeferEngine;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static FREED: AtomicUsize = AtomicUsize::new(0);
//!
//! fn free_node(p: *mut ()) {
//!     // A real callback would free the node `p` points at.
//!     FREED.fetch_add(p as usize, Ordering::SeqCst);
//! }
//!
//! // Real deployments plug in their RCU flavor's synchronize call.
//! let engine = DeferEngine::new(|| {});
//! let mut deferrer = engine.register().unwrap();
//!
//! unsafe { deferrer.defer(free_node, 0x40 as *mut ()) };
//!
//! // Drains every callback queued as of entry, after one grace period.
//! engine.barrier();
//! assert_eq!(FREED.load(Ordering::SeqCst), 0x40);
//! ```

mod config;
mod engine;
mod grace;
mod invariants;
mod metrics;
mod queue;
mod registry;
mod slot;
mod wake;

pub use config::{Config, HIGH_THROUGHPUT_CONFIG, LOW_LATENCY_CONFIG};
pub use engine::{DeferEngine, DeferError, DeferFn, Deferrer};
pub use grace::GracePeriod;
pub use metrics::MetricsSnapshot;
