//! Explicit-unlock synchronization primitives.
//!
//! These guard the five pieces of process-wide state the two subsystems
//! share: the buffer cache, the open-inode table, the frame table (split
//! into an allocation half and a free half), and the swap bitmap. There is
//! no scheduler here to park a waiting thread on, so both primitives are
//! spin-based; an embedding kernel that wants a blocking wait can wrap
//! [`SpinLock`] with its own parking logic without touching the callers in
//! `kernel-fs` / `kernel-vm`.

mod rwlock;
mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
