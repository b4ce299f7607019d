// SPDX-License-Identifier: MIT OR Apache-2.0

use super::common::{IrqGuardLocking, IrqLocking, UnguardedLocking};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

/// A guard that provides exclusive access to the data protected by a
/// [`RawSpinLock`]. The lock is released when the guard goes out of
/// scope.
#[derive(Debug)]
#[must_use = "if unused the SpinLock will immediately unlock"]
pub struct RawLockGuard<'a, T, I> {
    holder: &'a AtomicU64,
    data: &'a mut T,
    _irq_state: I,
}

impl<T, I> Drop for RawLockGuard<'_, T, I> {
    fn drop(&mut self) {
        self.holder.fetch_add(1, Ordering::Release);
    }
}

impl<T, I> Deref for RawLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data
    }
}

impl<T, I> DerefMut for RawLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

pub type SpinLockGuard<'a, T> = RawLockGuard<'a, T, UnguardedLocking>;
pub type SpinLockGuardIrqSafe<'a, T> = RawLockGuard<'a, T, IrqGuardLocking>;

/// Ticket spin lock. Tickets are handed out in acquisition order, so
/// waiters are served fairly.
#[derive(Debug, Default)]
pub struct RawSpinLock<T, I> {
    /// Next ticket to hand out.
    current: AtomicU64,
    /// Ticket currently allowed to hold the lock.
    holder: AtomicU64,
    data: UnsafeCell<T>,
    phantom: PhantomData<I>,
}

// SAFETY: the ticket protocol guarantees exclusive access to `data`
// while a guard exists.
unsafe impl<T: Send, I> Send for RawSpinLock<T, I> {}
// SAFETY: same as above, shared references only hand out data through
// the guard.
unsafe impl<T: Send, I> Sync for RawSpinLock<T, I> {}

impl<T, I: IrqLocking> RawSpinLock<T, I> {
    pub const fn new(data: T) -> Self {
        Self {
            current: AtomicU64::new(0),
            holder: AtomicU64::new(0),
            data: UnsafeCell::new(data),
            phantom: PhantomData,
        }
    }

    pub fn lock(&self) -> RawLockGuard<'_, T, I> {
        let irq_state = I::acquire_lock();

        let ticket = self.current.fetch_add(1, Ordering::Relaxed);
        while self.holder.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        RawLockGuard {
            holder: &self.holder,
            // SAFETY: the ticket protocol grants this thread exclusive
            // access until the guard drops.
            data: unsafe { &mut *self.data.get() },
            _irq_state: irq_state,
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub type SpinLock<T> = RawSpinLock<T, UnguardedLocking>;
pub type SpinLockIrqSafe<T> = RawSpinLock<T, IrqGuardLocking>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_cycle() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_into_inner() {
        let lock = SpinLock::new([1u8, 2, 3]);
        assert_eq!(lock.into_inner(), [1, 2, 3]);
    }
}
