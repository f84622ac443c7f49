//! The one fact this crate needs about the scheduler: who is currently running.
//!
//! Frame ownership bookkeeping (§4.5 of the spec) and per-thread
//! current-working-directory handles (§4.4) both need a stable identity for
//! "the thread calling me right now." This crate does not implement
//! scheduling, preemption, or blocking; it only consumes this one accessor.

/// Opaque identity of a kernel thread.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub u64);

/// Supplies the identity of the calling thread.
///
/// An embedding kernel implements this over its real scheduler; tests use a
/// fixed single-threaded identity.
pub trait CurrentThread {
    /// Returns the id of the thread calling this method.
    fn tid(&self) -> ThreadId;
}

/// A [`CurrentThread`] that always reports the same id. Useful for
/// single-threaded tests and embedders that have not wired up real thread
/// identities yet.
pub struct FixedThread(pub ThreadId);

impl CurrentThread for FixedThread {
    fn tid(&self) -> ThreadId {
        self.0
    }
}
