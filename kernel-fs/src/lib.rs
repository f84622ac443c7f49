//! An on-disk inode and directory file system layered over a 64-entry
//! write-back buffer cache.
//!
//! Module layout mirrors the dependency order in the spec: [`cache`] (L1) is
//! the only module that ever touches a [`kernel_core::block::BlockDevice`];
//! [`freemap`] and [`inode`] (L2) build on it; [`directory`] (L3) builds on
//! `inode`; [`file`] (L4) is the per-open handle the rest of a kernel hands
//! out as a file descriptor.
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod cache;
pub mod directory;
pub mod file;
pub mod freemap;
pub mod inode;

pub use cache::BufferCache;
pub use directory::Directory;
pub use file::FileHandle;
pub use freemap::FreeMap;
pub use inode::{InodeKind, InodeTable};
