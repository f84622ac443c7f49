//! A spinlock whose guard must be unlocked explicitly.
//!
//! Unlike a standard RAII mutex guard, dropping a [`SpinLockGuard`] without
//! first calling [`SpinLockGuard::unlock`] is a bug: the lock's call site is
//! recorded, and the `Drop` impl panics naming it. This makes it impossible
//! to "forget" to release a lock across an early return and have the bug
//! manifest only as a silent deadlock three call frames away.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired because it would block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual-exclusion primitive protecting a `T`.
///
/// Access is only possible through the guard returned by [`lock`](Self::lock)
/// or [`try_lock`](Self::try_lock).
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in the unlocked state.
    pub const fn new(t: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it becomes available.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            released: false,
        }
    }

    /// Attempts to acquire the lock without blocking.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self.locked.swap(true, Ordering::Acquire) {
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                released: false,
            })
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// A scoped guard for a [`SpinLock`].
///
/// The lock is held until [`unlock`](Self::unlock) is called. Dropping the
/// guard without unlocking it panics.
pub struct SpinLockGuard<'a, T: ?Sized> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    released: bool,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock. Must be called before the guard goes out of scope.
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.released = true;
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            panic!(
                "SpinLockGuard dropped without calling `.unlock()` (locked at {})",
                self.caller
            );
        }
    }
}
