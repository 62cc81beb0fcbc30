use crate::invariants::{
    debug_assert_bounded_count, debug_assert_monotonic, debug_assert_tail_not_past_head,
};
use crate::slot::{Record, FCT_BIT, FCT_MARK};
use crate::{Config, DeferFn};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// Each DeferQueue is a single-producer ring with a serialized consumer side:
//
// ## Sequence Numbers
//
// `head` and `tail` are unbounded u64 sequence numbers, never wrapped
// indices. Slot positions are computed as `sequence & mask` only when
// touching the ring. `head - tail` uses wrapping subtraction throughout, so
// the (practically unreachable) u64 wrap stays well-defined.
//
// ## Writer / reader roles
//
// - `head` is written only by the owning producer (`push_record`), read by
//   any thread. Producer loads it relaxed (it is the only writer) and
//   publishes with a release store after the slot stores.
// - `tail` is written only while holding the engine's defer mutex
//   (`drain_up_to`), read by the producer with acquire to measure fullness.
// - ring slots are written by the producer before the head publish and read
//   by the drainer after an acquire load of `head`, so the release/acquire
//   pair on `head` is what carries the slot contents across threads. The
//   per-slot release stores additionally order the slots among themselves.
// - `last_fct_out` is consumer-side scratch. It must persist across drain
//   passes: a producer keeps emitting bare-argument records for as long as
//   its callback does not change, including across a drain boundary. Only
//   the defer-mutex holder touches it, so relaxed ordering suffices.
//
// =============================================================================

/// Slots kept free so one `defer` call (up to 3 slots) can never overflow:
/// the producer self-drains once `head - tail >= capacity - HEADROOM`.
pub(crate) const HEADROOM: u64 = 2;

/// Per-thread ring of pending callbacks.
pub(crate) struct DeferQueue {
    /// Next slot to write (producer-owned).
    head: CachePadded<AtomicU64>,
    /// Next slot to consume (defer-mutex holders only).
    tail: CachePadded<AtomicU64>,
    /// Most recent function pointer the consumer decoded.
    last_fct_out: AtomicUsize,
    /// Fixed-size slot storage, indexed modulo capacity.
    ring: Box<[AtomicUsize]>,
    config: Config,
}

impl DeferQueue {
    pub(crate) fn new(config: Config) -> Self {
        let mut ring = Vec::with_capacity(config.capacity());
        ring.resize_with(config.capacity(), || AtomicUsize::new(0));

        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            last_fct_out: AtomicUsize::new(0),
            ring: ring.into_boxed_slice(),
            config,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// Current number of queued slots (not callbacks: a callback occupies
    /// 1 to 3 slots depending on its record shape).
    #[inline]
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    /// Acquire-loads the published head. Pairs with the release store in
    /// `push_record`, making every queued slot visible to the caller.
    #[inline]
    pub(crate) fn head_acquire(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Reads the tail. Stable while the defer mutex is held.
    #[inline]
    pub(crate) fn tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // PRODUCER SIDE (owning Deferrer only)
    // ---------------------------------------------------------------------

    /// Returns true when the owner must drain before appending: fewer than
    /// `HEADROOM + 1` free slots remain, so a worst-case 3-slot record
    /// could otherwise overwrite unconsumed entries.
    #[inline]
    pub(crate) fn needs_self_drain(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) >= self.capacity() as u64 - HEADROOM
    }

    /// Appends one encoded record and publishes the new head.
    ///
    /// Owner only. The caller must have checked `needs_self_drain` first;
    /// with the headroom reserve that guarantees the record fits.
    pub(crate) fn push_record(&self, record: &Record) {
        let head = self.head.load(Ordering::Relaxed);
        let mask = self.config.mask();

        let mut pos = head;
        for &bits in record.as_slice() {
            self.ring[(pos & mask) as usize].store(bits, Ordering::Release);
            pos = pos.wrapping_add(1);
        }

        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert_bounded_count!(pos.wrapping_sub(tail) as usize, self.capacity());
        debug_assert_monotonic!("head", head, pos);

        // Publishes the slot stores above: an acquire reader of head sees
        // every slot below it fully written.
        self.head.store(pos, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // CONSUMER SIDE (defer-mutex holder only)
    // ---------------------------------------------------------------------

    /// Decodes and invokes every callback from the tail up to (but not
    /// including) `head_snapshot`, then publishes the new tail. Returns the
    /// number of callbacks invoked.
    ///
    /// The caller must hold the defer mutex, must have obtained
    /// `head_snapshot` from [`head_acquire`](Self::head_acquire), and must
    /// have completed a grace period wait after taking the snapshot.
    pub(crate) fn drain_up_to(&self, head_snapshot: u64) -> u64 {
        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert_monotonic!("drain target", tail, head_snapshot);

        let mask = self.config.mask();
        let mut last_fct_out = self.last_fct_out.load(Ordering::Relaxed);
        let mut i = tail;
        let mut invoked = 0u64;

        while i != head_snapshot {
            let mut p = self.ring[(i & mask) as usize].load(Ordering::Relaxed);

            if p == FCT_MARK {
                i = i.wrapping_add(1);
                last_fct_out = self.ring[(i & mask) as usize].load(Ordering::Relaxed);
                i = i.wrapping_add(1);
                p = self.ring[(i & mask) as usize].load(Ordering::Relaxed);
            } else if p & FCT_BIT != 0 {
                last_fct_out = p & !FCT_BIT;
                i = i.wrapping_add(1);
                p = self.ring[(i & mask) as usize].load(Ordering::Relaxed);
            }

            debug_assert_ne!(
                last_fct_out, 0,
                "argument record with no preceding function record"
            );

            // SAFETY: the stream between tail and the snapshot is a
            // well-formed record sequence, so last_fct_out holds a function
            // pointer stored by defer(), whose contract makes it callable
            // with this argument on any thread once a grace period has
            // elapsed (which the caller guarantees).
            unsafe {
                let fct: DeferFn = std::mem::transmute::<usize, DeferFn>(last_fct_out);
                fct(p as *mut ());
            }

            invoked += 1;
            i = i.wrapping_add(1);
        }

        debug_assert_tail_not_past_head!(i, head_snapshot);
        self.last_fct_out.store(last_fct_out, Ordering::Relaxed);

        // Callbacks have retired; only now may the producer reuse the
        // slots below the new tail.
        self.tail.store(i, Ordering::Release);
        invoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::encode;
    use std::cell::RefCell;
    use std::time::Duration;

    thread_local! {
        static SEEN: RefCell<Vec<(u8, usize)>> = const { RefCell::new(Vec::new()) };
    }

    fn cb_a(p: *mut ()) {
        SEEN.with(|s| s.borrow_mut().push((b'a', p as usize)));
    }

    fn cb_b(p: *mut ()) {
        SEEN.with(|s| s.borrow_mut().push((b'b', p as usize)));
    }

    fn take_seen() -> Vec<(u8, usize)> {
        SEEN.with(|s| s.borrow_mut().drain(..).collect())
    }

    fn small_queue(bits: u8) -> DeferQueue {
        DeferQueue::new(Config::new(bits, Duration::from_millis(1), false))
    }

    fn push(q: &DeferQueue, fct: DeferFn, arg: usize, last_fct_in: &mut usize) {
        assert!(!q.needs_self_drain(), "test overfilled the ring");
        q.push_record(&encode(fct as usize, arg, last_fct_in));
    }

    #[test]
    fn test_roundtrip_single_record() {
        let q = small_queue(4);
        let mut last = 0;

        push(&q, cb_a, 0x4000, &mut last);
        assert_eq!(q.len(), 2); // tagged function + argument

        let invoked = q.drain_up_to(q.head_acquire());
        assert_eq!(invoked, 1);
        assert_eq!(take_seen(), vec![(b'a', 0x4000)]);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_burst_suppresses_function_slots() {
        let q = small_queue(4);
        let mut last = 0;

        for arg in [0x10, 0x20, 0x30, 0x40] {
            push(&q, cb_a, arg, &mut last);
        }
        // 1 function slot + 4 argument slots
        assert_eq!(q.len(), 5);

        let invoked = q.drain_up_to(q.head_acquire());
        assert_eq!(invoked, 4);
        assert_eq!(
            take_seen(),
            vec![(b'a', 0x10), (b'a', 0x20), (b'a', 0x30), (b'a', 0x40)]
        );
    }

    #[test]
    fn test_function_change_and_back() {
        let q = small_queue(4);
        let mut last = 0;

        push(&q, cb_a, 0x10, &mut last);
        push(&q, cb_b, 0x20, &mut last);
        push(&q, cb_a, 0x30, &mut last);

        let invoked = q.drain_up_to(q.head_acquire());
        assert_eq!(invoked, 3);
        assert_eq!(
            take_seen(),
            vec![(b'a', 0x10), (b'b', 0x20), (b'a', 0x30)]
        );
    }

    #[test]
    fn test_escaped_arguments_roundtrip() {
        let q = small_queue(4);
        let mut last = 0;

        push(&q, cb_a, 0x10, &mut last);
        // All of these would masquerade as tags if stored bare.
        for arg in [FCT_MARK, 0x41, 1, 0] {
            push(&q, cb_a, arg, &mut last);
        }

        let invoked = q.drain_up_to(q.head_acquire());
        assert_eq!(invoked, 5);
        assert_eq!(
            take_seen(),
            vec![
                (b'a', 0x10),
                (b'a', FCT_MARK),
                (b'a', 0x41),
                (b'a', 1),
                (b'a', 0),
            ]
        );
    }

    #[test]
    fn test_suppression_survives_drain_boundary() {
        let q = small_queue(4);
        let mut last = 0;

        push(&q, cb_a, 0x10, &mut last);
        assert_eq!(q.drain_up_to(q.head_acquire()), 1);

        // The producer's function cache still holds cb_a, so this record
        // is a bare argument; the consumer cache must resolve it.
        push(&q, cb_a, 0x20, &mut last);
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain_up_to(q.head_acquire()), 1);

        assert_eq!(take_seen(), vec![(b'a', 0x10), (b'a', 0x20)]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        // 8-slot ring, repeatedly filled and drained so indices wrap many
        // times while sequence numbers keep increasing.
        let q = small_queue(3);
        let mut last = 0;
        let mut expected = Vec::new();

        for round in 0..64usize {
            for k in 0..3usize {
                let arg = (round << 4) | (k << 1); // even, plainly encodable
                push(&q, cb_a, arg, &mut last);
                expected.push((b'a', arg));
            }
            assert_eq!(q.drain_up_to(q.head_acquire()), 3);
        }

        assert_eq!(take_seen(), expected);
        assert!(q.head_acquire() > 8, "indices never wrapped");
    }

    #[test]
    fn test_partial_drain_stops_at_snapshot() {
        let q = small_queue(4);
        let mut last = 0;

        push(&q, cb_a, 0x10, &mut last);
        let snapshot = q.head_acquire();
        push(&q, cb_a, 0x20, &mut last);

        // Only the first record is inside the snapshot.
        assert_eq!(q.drain_up_to(snapshot), 1);
        assert_eq!(take_seen(), vec![(b'a', 0x10)]);
        assert_eq!(q.len(), 1);

        assert_eq!(q.drain_up_to(q.head_acquire()), 1);
        assert_eq!(take_seen(), vec![(b'a', 0x20)]);
    }

    #[test]
    fn test_self_drain_threshold() {
        let q = small_queue(3); // 8 slots, threshold at 6
        let mut last = 0;

        push(&q, cb_a, 0x10, &mut last); // 2 slots
        for arg in [0x20, 0x30, 0x40] {
            push(&q, cb_a, arg, &mut last); // 1 slot each
        }
        assert_eq!(q.len(), 5);
        assert!(!q.needs_self_drain());

        push(&q, cb_a, 0x50, &mut last);
        assert_eq!(q.len(), 6);
        assert!(q.needs_self_drain());

        q.drain_up_to(q.head_acquire());
        assert!(!q.needs_self_drain());
        take_seen();
    }
}
