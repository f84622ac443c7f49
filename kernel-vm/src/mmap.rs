//! Memory-mapped files (§4.9): lazily-faulted FSYS mappings over a file,
//! tracked per process by mapid so `munmap` can write dirty pages back.

use crate::{
    UserPage,
    frame::{FrameAllocator, FrameTable},
    spt::{SpteState, SupplementalPageTable},
    swap::SwapArea,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kernel_core::{block::BlockDevice, config::PAGE_SIZE, error::KernelError, pagedir::PageDirectory, sync::SpinLock};

/// The file identity and write-back primitive an mmap needs, supplied by
/// the embedding kernel (which is the only party that knows how to address
/// an open file). Kept file-system-agnostic so this crate does not depend
/// on `kernel-fs`.
pub trait Backing: Send + Sync {
    /// Current length of the file in bytes.
    fn len(&self) -> usize;
    /// True if the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Writes `data` to the file starting at byte `offset`.
    fn write_at(&self, offset: usize, data: &[u8]);
    /// Reads up to `buf.len()` bytes from the file starting at `offset`,
    /// returning the number read.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;
}

struct Mapping {
    file: Arc<dyn Backing>,
    pages: Vec<UserPage>,
}

/// Per-process table of active memory-mapped regions, keyed by mapid.
pub struct MmapTable {
    mappings: SpinLock<BTreeMap<usize, Mapping>>,
}

impl MmapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        MmapTable {
            mappings: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Maps `file` at `addr`, creating one FSYS SPTE per page of the
    /// file's length. Fails if `addr` is null, unaligned, the file is
    /// empty, or any covered page is already mapped.
    pub fn mmap(
        &self,
        spt: &SupplementalPageTable,
        addr: usize,
        file: Arc<dyn Backing>,
    ) -> Result<usize, KernelError> {
        if addr == 0 || addr % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = file.len();
        if size == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let page_count = size.div_ceil(PAGE_SIZE);
        let pages: Vec<UserPage> = (0..page_count).map(|i| UserPage(addr + i * PAGE_SIZE)).collect();
        if pages.iter().any(|p| spt.contains(*p)) {
            return Err(KernelError::InvalidArgument);
        }

        for (i, upage) in pages.iter().enumerate() {
            let offset = i * PAGE_SIZE;
            let read_bytes = (size - offset).min(PAGE_SIZE);
            let zero_bytes = PAGE_SIZE - read_bytes;
            spt.make_spte_filesys(*upage, file.clone(), offset, read_bytes, zero_bytes, true);
        }

        let mut mappings = self.mappings.lock();
        let mapid = mappings.keys().next_back().copied().unwrap_or(0) + 1;
        mappings.insert(mapid, Mapping { file, pages });
        mappings.unlock();
        Ok(mapid)
    }

    /// Unmaps `mapid`: writes any dirty page back to its file offset, frees
    /// every SPTE and (if resident) its frame, and drops the mapping.
    pub fn munmap<A: FrameAllocator, D: BlockDevice>(
        &self,
        mapid: usize,
        spt: &SupplementalPageTable,
        frames: &FrameTable<A>,
        swap: &SwapArea<D>,
        pagedir: &mut dyn PageDirectory,
    ) {
        let mapping = {
            let mut mappings = self.mappings.lock();
            let m = mappings.remove(&mapid);
            mappings.unlock();
            m
        };
        let Some(mapping) = mapping else { return };

        for (i, upage) in mapping.pages.iter().enumerate() {
            let offset = i * PAGE_SIZE;
            let Some(spte) = spt.remove(*upage) else {
                continue;
            };
            let dirty = spte.dirty || pagedir.is_dirty(upage.addr());
            match spte.state {
                SpteState::InFrame(frame) => {
                    if dirty {
                        let bytes = unsafe { frame.as_slice() };
                        mapping.file.write_at(offset, bytes);
                    }
                    pagedir.clear(upage.addr());
                    frames.free(frame);
                }
                SpteState::InSwap(slot) => {
                    if dirty {
                        let mut scratch = alloc::vec![0u8; PAGE_SIZE];
                        swap.swap_in(slot, &mut scratch);
                        mapping.file.write_at(offset, &scratch);
                    } else {
                        swap.free_swap(slot);
                    }
                }
                SpteState::Fsys { .. } | SpteState::AllZero => {}
            }
        }
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}
