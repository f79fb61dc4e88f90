//! Test-and-set lock for short scheduler critical sections

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set lock guarding a value
///
/// Contended acquisition busy-waits with a pause hint; there is no
/// queueing and no parking. Suitable only for critical sections of a
/// few dozen instructions (slot swaps, counter updates), and never
/// across a fiber suspension point: the lock is per-OS-thread and the
/// resuming worker may differ from the suspender.
pub struct TasLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the flag serializes all access to the value
unsafe impl<T: Send> Send for TasLock<T> {}
unsafe impl<T: Send> Sync for TasLock<T> {}

impl<T> TasLock<T> {
    /// Wrap a value in a lock
    #[inline]
    pub const fn new(value: T) -> Self {
        TasLock {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire, spinning until the flag clears
    #[inline]
    pub fn lock(&self) -> TasGuard<'_, T> {
        while self.flag.swap(true, Ordering::Acquire) {
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        TasGuard { lock: self }
    }

    /// Acquire only if the lock is free right now
    #[inline]
    pub fn try_lock(&self) -> Option<TasGuard<'_, T>> {
        if self.flag.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(TasGuard { lock: self })
        }
    }
}

impl<T: Default> Default for TasLock<T> {
    fn default() -> Self {
        TasLock::new(T::default())
    }
}

/// Releases the lock on drop
pub struct TasGuard<'a, T> {
    lock: &'a TasLock<T>,
}

impl<T> Deref for TasGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the flag is ours until drop
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TasGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the flag is ours until drop
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TasGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_guard_gives_exclusive_access() {
        let lock = TasLock::new(5u32);
        *lock.lock() += 12;
        assert_eq!(*lock.lock(), 17);
    }

    #[test]
    fn test_try_lock_while_held() {
        let lock = TasLock::new(());
        let held = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_counter_under_contention() {
        let lock = Arc::new(TasLock::new(0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
