use crate::IrqGuard;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A test-and-set spin lock around `T`.
///
/// The allocator tables are kernel-wide singletons mutated only inside
/// interrupt-masked sections; use [`SpinLock::lock_irq`] for those. The plain
/// [`SpinLock::lock`] exists for contexts where interrupts are already off.
pub struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// SAFETY: the lock provides mutual exclusion; only `T: Send` may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns `None` if the lock is held.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Spin until acquired.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Disable interrupts, then acquire.
    ///
    /// Dropping the returned guard releases the lock and then restores the
    /// interrupt state, in that order.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinGuard { guard, _irq: irq }
    }

    /// Closure convenience over [`lock_irq`](Self::lock_irq).
    #[inline]
    pub fn with_irq_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock_irq();
        f(&mut guard)
    }

    /// Direct access with `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A [`SpinLockGuard`] taken with interrupts masked.
///
/// Field order matters: the lock guard drops before the interrupt state is
/// restored.
pub struct IrqSpinGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let l = SpinLock::new(0u32);
        {
            let mut g = l.lock();
            *g = 41;
        }
        {
            let mut g = l.lock();
            *g += 1;
            assert_eq!(*g, 42);
        }
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l = SpinLock::new(());
        let g = l.try_lock();
        assert!(g.is_some());
        assert!(l.try_lock().is_none());
        drop(g);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn irq_lock_masks_interrupts() {
        let l = SpinLock::new(7u8);
        {
            let mut g = l.lock_irq();
            assert!(!crate::irq::interrupts_enabled());
            *g += 1;
        }
        assert_eq!(*l.lock(), 8);
    }

    #[test]
    fn with_irq_lock_returns_value() {
        let l = SpinLock::new(vec![1, 2]);
        let len = l.with_irq_lock(|v| {
            v.push(3);
            v.len()
        });
        assert_eq!(len, 3);
    }
}
