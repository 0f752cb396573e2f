//! Synchronization primitives, switchable to `loom` for model checking.

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex,
};
#[cfg(not(feature = "loom"))]
use std::sync::MutexGuard;
use std::{sync::PoisonError, time::Duration};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex,
};
#[cfg(feature = "loom")]
use loom::sync::MutexGuard;

#[cfg_attr(feature = "loom", allow(dead_code))]
const SPINS_PER_SLEEP: u32 = 100;
#[cfg_attr(feature = "loom", allow(dead_code))]
const SLEEP_DURATION: Duration = Duration::from_micros(50);

/// Acquires the given mutex, recovering the guard if a previous holder panicked.
///
/// Every lock in this crate protects plain counters or cursors that are valid after any partial update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded backoff for the short waits producers perform during buffer rotation.
///
/// Spins with a CPU hint, and sleeps briefly once every `SPINS_PER_SLEEP` spins so a descheduled peer can make
/// progress.
pub(crate) struct Backoff {
    spins: u32,
}

impl Backoff {
    pub(crate) const fn new() -> Self {
        Self { spins: 0 }
    }

    #[cfg(not(feature = "loom"))]
    pub(crate) fn snooze(&mut self) {
        self.spins = self.spins.wrapping_add(1);
        if self.spins % SPINS_PER_SLEEP == 0 {
            std::thread::sleep(SLEEP_DURATION);
        } else {
            std::hint::spin_loop();
        }
    }

    #[cfg(feature = "loom")]
    pub(crate) fn snooze(&mut self) {
        self.spins = self.spins.wrapping_add(1);
        loom::thread::yield_now();
    }
}
