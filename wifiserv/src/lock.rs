//! Spinlock guarding the shared stack state.
//!
//! The stack is mutated both by the application's polling loop and by the
//! server/client facades, so all access goes through a single lock. Only the
//! swap-based variant is provided; one lock guards the whole stack state, so
//! fairness buys nothing here.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

// Lock states as u32 for 32-bit atomic operations. Byte-sized atomics are
// not reliably serialized on some embedded targets; 32-bit swaps are.
const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual exclusion primitive based on spinning.
///
/// # Example
///
/// ```ignore
/// static COUNTER: Spinlock<u64> = Spinlock::new(0);
///
/// fn increment() {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// }
/// ```
pub struct Spinlock<T> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: Spinlock provides synchronized access to T
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new spinlock wrapping the given value.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until available.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self.locked.swap(LOCKED, Ordering::Acquire) == LOCKED {
            while self.locked.load(Ordering::Relaxed) == LOCKED {
                spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.locked.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Consume the lock and return the inner value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard returned by [`Spinlock::lock`]. The lock is released on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(UNLOCKED, Ordering::Release);
    }
}
