use std::time::Duration;

/// Configuration for a [`DeferEngine`](crate::DeferEngine).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Per-thread ring size as a power of 2 (default: 14 = 16384 slots).
    pub ring_bits: u8,
    /// How long the reclamation thread sleeps after a wake-up so that
    /// producers can batch more callbacks into the same barrier pass.
    pub coalesce_delay: Duration,
    /// Enable metrics collection (slight overhead).
    pub enable_metrics: bool,
}

impl Config {
    /// Creates a new configuration with custom settings.
    ///
    /// # Panics
    ///
    /// Panics if `ring_bits` is outside `3..=20`. A record occupies up to
    /// 3 slots, so rings smaller than 8 slots cannot hold a record plus
    /// the fullness reserve; 1M slots is the sanity ceiling.
    pub const fn new(ring_bits: u8, coalesce_delay: Duration, enable_metrics: bool) -> Self {
        assert!(
            ring_bits >= 3 && ring_bits <= 20,
            "ring_bits must be between 3 and 20 (8 slots to 1M slots)"
        );

        Self {
            ring_bits,
            coalesce_delay,
            enable_metrics,
        }
    }

    /// Returns the slot capacity of each per-thread ring.
    #[inline]
    pub const fn capacity(&self) -> usize {
        1 << self.ring_bits
    }

    /// Returns the mask for slot index wrapping.
    #[inline]
    pub const fn mask(&self) -> u64 {
        (self.capacity() - 1) as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_bits: 14, // 16K slots
            coalesce_delay: Duration::from_millis(100),
            enable_metrics: false,
        }
    }
}

/// Low latency configuration: small rings, short coalescing window.
///
/// Self-drains kick in earlier, so producers pay grace periods more often
/// in exchange for less memory held back from reclamation.
pub const LOW_LATENCY_CONFIG: Config = Config::new(8, Duration::from_millis(10), false);

/// High throughput configuration: large rings, long coalescing window.
pub const HIGH_THROUGHPUT_CONFIG: Config = Config::new(18, Duration::from_millis(250), false);
