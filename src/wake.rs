//! Single-slot sleep/wake primitive for the reclamation thread.
//!
//! The whole channel is one waitable 32-bit word: 0 means no waiter, -1
//! means the reclamation thread is (about to be) sleeping on it. Producers
//! nudge the thread with [`post`](WakeChannel::post) after publishing new
//! work; the thread announces itself with
//! [`prepare_wait`](WakeChannel::prepare_wait) before re-checking for work
//! and blocking.
//!
//! Losing a wake-up is the failure mode this module exists to prevent. The
//! waiter stores -1 *before* re-reading the queue state; the producer
//! publishes its queue *before* reading the word. With a full fence
//! between each side's store and subsequent read, at least one side must
//! observe the other: either the producer sees -1 and issues a wake, or
//! the waiter sees the pending work and cancels its sleep.
//!
//! On Linux the block/wake pair is a private futex; elsewhere a
//! mutex/condvar pair guards the same word with the same contract.

use std::sync::atomic::{fence, AtomicI32, Ordering};
#[cfg(not(target_os = "linux"))]
use std::sync::{Condvar, Mutex};

const IDLE: i32 = 0;
const WAITING: i32 = -1;

pub(crate) struct WakeChannel {
    word: AtomicI32,
    #[cfg(not(target_os = "linux"))]
    lock: Mutex<()>,
    #[cfg(not(target_os = "linux"))]
    condvar: Condvar,
}

impl WakeChannel {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicI32::new(IDLE),
            #[cfg(not(target_os = "linux"))]
            lock: Mutex::new(()),
            #[cfg(not(target_os = "linux"))]
            condvar: Condvar::new(),
        }
    }

    /// Announces intent to sleep. The caller must re-check for pending
    /// work *after* this returns and either [`cancel_wait`](Self::cancel_wait)
    /// or [`block`](Self::block).
    pub(crate) fn prepare_wait(&self) {
        self.word.store(WAITING, Ordering::SeqCst);
        // Full fence: the -1 store must be globally visible before the
        // caller's re-read of the queue state.
        fence(Ordering::SeqCst);
    }

    /// Withdraws a `prepare_wait` because work (or cancellation) was
    /// observed before blocking.
    pub(crate) fn cancel_wait(&self) {
        self.word.store(IDLE, Ordering::SeqCst);
    }

    /// Blocks until the word leaves the waiting state. Tolerates spurious
    /// wake-ups; the caller's loop re-checks for work regardless.
    #[cfg(target_os = "linux")]
    pub(crate) fn block(&self) {
        while self.word.load(Ordering::SeqCst) == WAITING {
            // EAGAIN (word already changed), EINTR, and genuine wakes all
            // land back in the loop condition.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.word.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    WAITING,
                    std::ptr::null::<libc::timespec>(),
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn block(&self) {
        let mut guard = self.lock.lock().expect("wake channel mutex poisoned");
        while self.word.load(Ordering::SeqCst) == WAITING {
            guard = self
                .condvar
                .wait(guard)
                .expect("wake channel mutex poisoned");
        }
    }

    /// Producer-side nudge. Returns true if a waiter was woken.
    ///
    /// The caller must have published its queue state (head store) before
    /// calling; the fence here orders that publish before the word read.
    pub(crate) fn post(&self) -> bool {
        fence(Ordering::SeqCst);
        if self.word.load(Ordering::SeqCst) != WAITING {
            return false;
        }
        self.set_idle_and_wake();
        true
    }

    /// Unconditional wake, used for shutdown: clears the word and wakes
    /// the waiter whether or not it was sleeping yet.
    pub(crate) fn force_post(&self) {
        self.set_idle_and_wake();
    }

    #[cfg(target_os = "linux")]
    fn set_idle_and_wake(&self) {
        self.word.store(IDLE, Ordering::SeqCst);
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_idle_and_wake(&self) {
        {
            let _guard = self.lock.lock().expect("wake channel mutex poisoned");
            self.word.store(IDLE, Ordering::SeqCst);
        }
        self.condvar.notify_one();
    }
}
