//! A virtual memory layer: a frame table over physical pages, a per-process
//! supplemental page table, a swap area, and the page-fault handler that
//! ties them together (§4.5-§4.9).
//!
//! This crate does not know about the on-disk file system directly ([`mmap`]
//! writes back through a small [`mmap::Backing`] trait instead of
//! `kernel-fs` types) so that the dependency graph stays one-directional: an
//! embedding kernel wires `kernel-fs` in as the concrete `Backing`.
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod fault;
pub mod frame;
pub mod mmap;
pub mod spt;
pub mod swap;
pub mod uaccess;

pub use fault::{FaultOutcome, handle_page_fault};
pub use frame::{FrameAllocator, FrameTable, KernelVirtualAddress};
pub use spt::{Spte, SpteState, SupplementalPageTable};
pub use swap::SwapArea;
pub use uaccess::{AccessCheck, PageFaultContext, UserCString, UserPtrRo, UserPtrWo, UserSliceRo, UserSliceWo};

/// A page-aligned user virtual address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct UserPage(pub usize);

impl UserPage {
    /// Rounds `addr` down to its containing page.
    pub fn containing(addr: usize) -> Self {
        UserPage(addr & !(kernel_core::config::PAGE_SIZE - 1))
    }

    /// The raw address.
    pub fn addr(self) -> usize {
        self.0
    }
}
