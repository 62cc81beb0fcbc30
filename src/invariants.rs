//! Debug assertion macros for defer queue invariants.
//!
//! Active only in debug builds, so there is zero overhead in release
//! builds. Used by `DeferQueue` on both the producer and drain paths.

/// Assert that the queued slot count does not exceed the ring capacity.
///
/// Holds at every observation: `0 <= head - tail <= capacity`.
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "defer queue overflow: {} queued slots exceed capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that a sequence index only increases (wrap-tolerant).
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old || $old.wrapping_sub($new) > (1u64 << 32),
            "defer queue {} went backwards: {} -> {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that the drain target does not pass the published head.
macro_rules! debug_assert_tail_not_past_head {
    ($new_tail:expr, $head:expr) => {
        debug_assert!(
            $new_tail <= $head,
            "draining past published head: tail {} beyond head {}",
            $new_tail,
            $head
        )
    };
}

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_tail_not_past_head;
