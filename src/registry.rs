use crate::queue::DeferQueue;
use std::sync::Arc;

/// One registered deferrer: its queue plus the head snapshot taken by the
/// most recent barrier pass.
pub(crate) struct Entry {
    pub(crate) queue: Arc<DeferQueue>,
    pub(crate) last_head: u64,
}

/// Table of every registered defer queue.
///
/// All access happens under the engine's defer mutex. Iteration order is
/// irrelevant to the barrier engine, so removal moves the last entry into
/// the vacated slot. The backing vector starts at capacity 4, grows
/// geometrically, and never shrinks.
pub(crate) struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::with_capacity(4),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn add(&mut self, queue: Arc<DeferQueue>) {
        self.entries.push(Entry {
            queue,
            last_head: 0,
        });
    }

    /// Removes the entry for `queue`.
    ///
    /// # Panics
    ///
    /// Panics if the queue was never registered; unregistering twice is a
    /// programming error in the caller.
    pub(crate) fn remove(&mut self, queue: &Arc<DeferQueue>) {
        let idx = self
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.queue, queue))
            .expect("unregistering a deferrer that was never registered");
        self.entries.swap_remove(idx);
    }

    /// Acquire-loads every queue's head into its entry snapshot and
    /// returns the total number of pending slots across the table.
    pub(crate) fn snapshot_heads(&mut self) -> u64 {
        let mut pending = 0u64;
        for entry in &mut self.entries {
            entry.last_head = entry.queue.head_acquire();
            pending += entry.last_head.wrapping_sub(entry.queue.tail());
        }
        pending
    }

    /// Total pending slots without refreshing the barrier snapshots. Used
    /// by the reclamation thread to decide whether to sleep.
    pub(crate) fn pending_slots(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.queue.head_acquire().wrapping_sub(e.queue.tail()))
            .sum()
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }
}
