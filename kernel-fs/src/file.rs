//! Per-open file handles and the per-process open-file table (§3, §6): an
//! owned inode reference plus a byte position, indexed by file descriptor
//! with fds 0 and 1 reserved for console input/output.

use crate::inode::{Inode, InodeTable};
use alloc::sync::Arc;
use kernel_core::{
    block::BlockDevice,
    config::{FD_STDIN, FD_STDOUT, MAX_OPEN_FILES},
    error::KernelError,
};

/// An open file: an inode reference plus a byte position that `read`/`write`
/// advance and `seek`/`tell` expose directly.
pub struct FileHandle {
    inode: Arc<Inode>,
    pos: usize,
}

impl FileHandle {
    /// Wraps an already-open inode at position 0.
    pub fn new(inode: Arc<Inode>) -> Self {
        FileHandle { inode, pos: 0 }
    }

    /// The underlying inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Current byte length of the underlying file.
    pub fn filesize(&self) -> usize {
        self.inode.length()
    }

    /// Current byte position.
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Repositions for the next read/write. Seeking past EOF is legal; the
    /// next write will grow the file to cover the gap.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Reads into `dst` starting at the current position, advancing it by
    /// the number of bytes actually read.
    pub fn read<D: BlockDevice>(&mut self, table: &InodeTable<D>, dst: &mut [u8]) -> usize {
        let n = table.read_at(&self.inode, dst, self.pos);
        self.pos += n;
        n
    }

    /// Writes `src` starting at the current position, advancing it by the
    /// number of bytes actually written.
    pub fn write<D: BlockDevice>(&mut self, table: &InodeTable<D>, src: &[u8]) -> Result<usize, KernelError> {
        let n = table.write_at(&self.inode, src, self.pos)?;
        self.pos += n;
        Ok(n)
    }
}

/// A process's fixed-capacity fd → handle table. Slots 0 and 1 are always
/// reserved for console input/output and never hold a [`FileHandle`].
pub struct OpenFileTable {
    slots: [Option<FileHandle>; MAX_OPEN_FILES],
}

impl OpenFileTable {
    /// Creates an empty table with the console slots reserved.
    pub fn new() -> Self {
        OpenFileTable {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Installs `handle` in the lowest free slot above the console fds,
    /// returning its descriptor. Fails if the table is full.
    pub fn insert(&mut self, handle: FileHandle) -> Result<usize, KernelError> {
        for fd in (FD_STDOUT + 1)..MAX_OPEN_FILES {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(handle);
                return Ok(fd);
            }
        }
        Err(KernelError::TooManyOpenFile)
    }

    /// Borrows the handle at `fd`, if any non-reserved slot holds one.
    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FileHandle> {
        if fd == FD_STDIN || fd == FD_STDOUT || fd >= MAX_OPEN_FILES {
            return None;
        }
        self.slots[fd].as_mut()
    }

    /// Removes and returns the handle at `fd`, if present.
    pub fn take(&mut self, fd: usize) -> Option<FileHandle> {
        if fd == FD_STDIN || fd == FD_STDOUT || fd >= MAX_OPEN_FILES {
            return None;
        }
        self.slots[fd].take()
    }

    /// Every currently-occupied non-reserved slot, for process teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = FileHandle> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
