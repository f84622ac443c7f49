//! A reader-writer lock with the same explicit-unlock discipline as
//! [`super::SpinLock`].
//!
//! Used for the open-inode deduplication table: `open()` lookups are far
//! more common than the insert/remove that happens when an inode's refcount
//! goes from/to zero, so letting lookups run concurrently matters.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

const WRITER: usize = 1 << (usize::BITS - 1);

/// A reader-writer lock protecting a `T`.
pub struct RwLock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new, unlocked `RwLock`.
    pub const fn new(t: T) -> Self {
        RwLock {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires the lock for shared (read) access, spinning until available.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwLockReadGuard {
                    lock: self,
                    released: false,
                };
            }
            core::hint::spin_loop();
        }
    }

    /// Acquires the lock for exclusive (write) access, spinning until available.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwLockWriteGuard {
                    lock: self,
                    released: false,
                };
            }
            core::hint::spin_loop();
        }
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        RwLock::new(T::default())
    }
}

/// A scoped shared-access guard for an [`RwLock`].
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    released: bool,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> RwLockReadGuard<'_, T> {
    /// Releases the shared lock.
    pub fn unlock(mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        self.released = true;
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            panic!("RwLockReadGuard dropped without calling `.unlock()`");
        }
    }
}

/// A scoped exclusive-access guard for an [`RwLock`].
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    released: bool,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> RwLockWriteGuard<'_, T> {
    /// Releases the exclusive lock.
    pub fn unlock(mut self) {
        self.lock.state.store(0, Ordering::Release);
        self.released = true;
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            panic!("RwLockWriteGuard dropped without calling `.unlock()`");
        }
    }
}
