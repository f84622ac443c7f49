//! Ambient kernel-wide scaffolding shared by the file-system and
//! virtual-memory subsystems: the error type, the explicit-unlock
//! synchronization primitives, the console/log macros, and the handful of
//! traits through which this crate talks to the rest of a hosting kernel
//! (block device, page directory, current-thread identity).
//!
//! Nothing in this crate drives hardware. It exists so that `kernel-fs` and
//! `kernel-vm` can be written once against stable abstractions and reused by
//! any embedding kernel that supplies real implementations of [`block`] and
//! [`pagedir`].
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod console;
pub mod error;
pub mod pagedir;
pub mod sync;
pub mod thread;

pub use error::KernelError;
