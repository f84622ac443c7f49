//! The page-fault handler (§4.8): the state-machine transition table that
//! resolves a user page fault into a resident frame, or a process kill.

use crate::{
    UserPage,
    frame::{FrameAllocator, FrameTable, KernelVirtualAddress},
    spt::{Spte, SpteResident, SpteState, SupplementalPageTable},
    swap::SwapArea,
};
use kernel_core::{
    block::BlockDevice,
    config::{PAGE_SIZE, STACK_FAULT_SLACK, STACK_LIMIT},
    pagedir::PageDirectory,
    thread::ThreadId,
};

/// Result of handling one page fault.
#[derive(Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The fault was resolved; execution may resume.
    Resolved,
    /// The fault is not recoverable; the process must be terminated with
    /// exit code -1 (§7).
    Kill,
}

/// Resolves a non-present page fault at user address `fault_addr` (already
/// known not to be a rights violation on a present page, and not in kernel
/// space — callers reject those before calling in, per step 1 of §4.8).
///
/// `esp` is the user stack pointer captured at fault/syscall entry,
/// `stack_bottom` is the lowest address of the thread's initial stack page
/// (the reference point the 8 MiB cap and growth check are both relative
/// to).
#[allow(clippy::too_many_arguments)]
pub fn handle_page_fault<A: FrameAllocator, D: BlockDevice>(
    owner: ThreadId,
    fault_addr: usize,
    spt: &SupplementalPageTable,
    frames: &FrameTable<A>,
    swap: &SwapArea<D>,
    pagedir: &mut dyn PageDirectory,
    esp: usize,
    stack_bottom: usize,
) -> FaultOutcome {
    let upage = UserPage::containing(fault_addr);

    if spt.contains(upage) {
        return load_page(upage, owner, spt, frames, swap, pagedir);
    }

    if is_stack_growth(fault_addr, esp, stack_bottom) {
        return match frames.allocate(owner, upage, swap, |_, victim| SpteResident::new(spt, victim, &mut *pagedir)) {
            Ok(frame) => {
                spt.make_spte(upage, frame, true);
                if pagedir.install(upage.addr(), frame.0, true) {
                    frames.unpin(frame);
                    FaultOutcome::Resolved
                } else {
                    FaultOutcome::Kill
                }
            }
            Err(_) => FaultOutcome::Kill,
        };
    }

    FaultOutcome::Kill
}

fn is_stack_growth(fault_addr: usize, esp: usize, stack_bottom: usize) -> bool {
    let upage = UserPage::containing(fault_addr).addr();
    if upage >= stack_bottom {
        return false;
    }
    if stack_bottom - upage > STACK_LIMIT {
        return false;
    }
    fault_addr + STACK_FAULT_SLACK >= esp
}

fn load_page<A: FrameAllocator, D: BlockDevice>(
    upage: UserPage,
    owner: ThreadId,
    spt: &SupplementalPageTable,
    frames: &FrameTable<A>,
    swap: &SwapArea<D>,
    pagedir: &mut dyn PageDirectory,
) -> FaultOutcome {
    let already_resident = spt
        .with_mut(upage, |e| matches!(e.state, SpteState::InFrame(_)))
        .unwrap_or(false);
    if already_resident {
        return FaultOutcome::Resolved;
    }

    let writable = spt.with_mut(upage, |e| e.writable).unwrap_or(false);
    let frame = match frames.allocate(owner, upage, swap, |_, victim| SpteResident::new(spt, victim, &mut *pagedir)) {
        Ok(f) => f,
        Err(_) => return FaultOutcome::Kill,
    };

    let result = spt.with_mut(upage, |e| {
        populate_frame(e, frame, swap);
        e.state = SpteState::InFrame(frame);
    });
    if result.is_none() {
        frames.free(frame);
        return FaultOutcome::Kill;
    }

    if pagedir.install(upage.addr(), frame.0, writable) {
        frames.unpin(frame);
        FaultOutcome::Resolved
    } else {
        FaultOutcome::Kill
    }
}

fn populate_frame<D: BlockDevice>(entry: &mut Spte, frame: KernelVirtualAddress, swap: &SwapArea<D>) {
    let dst = unsafe { frame.as_mut_slice() };
    match &entry.state {
        SpteState::InFrame(_) => {}
        SpteState::InSwap(slot) => {
            swap.swap_in(*slot, dst);
        }
        SpteState::Fsys {
            file,
            offset,
            read_bytes,
            zero_bytes,
        } => {
            file.read_at(*offset, &mut dst[..*read_bytes]);
            dst[*read_bytes..*read_bytes + *zero_bytes].fill(0);
        }
        SpteState::AllZero => {
            dst[..PAGE_SIZE].fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTable;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use kernel_core::sync::SpinLock as CoreSpinLock;

    struct BumpAllocator {
        pages: CoreSpinLock<alloc::vec::Vec<u8>>,
        next: AtomicUsize,
        capacity: usize,
    }

    impl BumpAllocator {
        fn new(capacity: usize) -> Self {
            BumpAllocator {
                pages: CoreSpinLock::new(alloc::vec![0u8; capacity * PAGE_SIZE]),
                next: AtomicUsize::new(0),
                capacity,
            }
        }
    }

    impl FrameAllocator for Arc<BumpAllocator> {
        fn alloc_zeroed_frame(&self) -> Option<KernelVirtualAddress> {
            let idx = self.next.load(Ordering::SeqCst);
            if idx >= self.capacity {
                return None;
            }
            self.next.store(idx + 1, Ordering::SeqCst);
            let guard = self.pages.lock();
            let addr = guard.as_ptr() as usize + idx * PAGE_SIZE;
            guard.unlock();
            Some(KernelVirtualAddress(addr))
        }
        fn free_frame(&self, _frame: KernelVirtualAddress) {}
    }

    struct NullDevice;
    impl BlockDevice for NullDevice {
        fn read_sector(&self, _sector: u32, _buf: &mut [u8; kernel_core::config::SECTOR_SIZE]) {}
        fn write_sector(&self, _sector: u32, _buf: &[u8; kernel_core::config::SECTOR_SIZE]) {}
    }

    struct FakePagedir {
        installed: alloc::collections::BTreeMap<usize, (usize, bool)>,
    }
    impl PageDirectory for FakePagedir {
        fn install(&mut self, upage: usize, kpage: usize, writable: bool) -> bool {
            self.installed.insert(upage, (kpage, writable));
            true
        }
        fn clear(&mut self, upage: usize) {
            self.installed.remove(&upage);
        }
        fn get(&self, upage: usize) -> Option<usize> {
            self.installed.get(&upage).map(|(k, _)| *k)
        }
        fn is_dirty(&self, _upage: usize) -> bool {
            false
        }
        fn clear_dirty(&mut self, _upage: usize) {}
    }

    #[test]
    fn stack_growth_allocates_a_fresh_zero_page() {
        let spt = SupplementalPageTable::new();
        let frames = FrameTable::new(Arc::new(BumpAllocator::new(4)));
        let swap = SwapArea::new(NullDevice, 1);
        let mut pagedir = FakePagedir {
            installed: alloc::collections::BTreeMap::new(),
        };
        let stack_bottom = 0x8000_0000 - PAGE_SIZE;
        let esp = 0x8000_0000 - 4;
        let fault_addr = stack_bottom;

        let outcome = handle_page_fault(ThreadId(1), fault_addr, &spt, &frames, &swap, &mut pagedir, esp, stack_bottom);
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(pagedir.get(UserPage::containing(fault_addr).addr()).is_some());
    }

    #[test]
    fn far_below_stack_pointer_is_not_growth_and_kills() {
        let spt = SupplementalPageTable::new();
        let frames = FrameTable::new(Arc::new(BumpAllocator::new(4)));
        let swap = SwapArea::new(NullDevice, 1);
        let mut pagedir = FakePagedir {
            installed: alloc::collections::BTreeMap::new(),
        };
        let stack_bottom = 0x8000_0000 - PAGE_SIZE;
        let esp = 0x8000_0000 - 4;
        let fault_addr = stack_bottom - 10 * PAGE_SIZE;

        let outcome = handle_page_fault(ThreadId(1), fault_addr, &spt, &frames, &swap, &mut pagedir, esp, stack_bottom);
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn all_zero_spte_loads_a_zeroed_page() {
        let spt = SupplementalPageTable::new();
        let frames = FrameTable::new(Arc::new(BumpAllocator::new(4)));
        let swap = SwapArea::new(NullDevice, 1);
        let mut pagedir = FakePagedir {
            installed: alloc::collections::BTreeMap::new(),
        };
        spt.make_spte_zero(UserPage(0x4000), true);

        let outcome = handle_page_fault(ThreadId(1), 0x4000, &spt, &frames, &swap, &mut pagedir, 0, 0);
        assert_eq!(outcome, FaultOutcome::Resolved);
    }

    #[test]
    fn exhaustion_triggers_real_eviction_and_retried_allocation_succeeds() {
        let spt = SupplementalPageTable::new();
        let frames = FrameTable::new(Arc::new(BumpAllocator::new(1)));
        let swap = SwapArea::new(NullDevice, 2);
        let mut pagedir = FakePagedir {
            installed: alloc::collections::BTreeMap::new(),
        };
        spt.make_spte_zero(UserPage(0x5000), true);
        spt.make_spte_zero(UserPage(0x6000), true);

        let first = handle_page_fault(ThreadId(1), 0x5000, &spt, &frames, &swap, &mut pagedir, 0, 0);
        assert_eq!(first, FaultOutcome::Resolved);
        let first_kpage = pagedir.get(0x5000).unwrap();
        frames.unpin(KernelVirtualAddress(first_kpage));

        // The bump allocator is exhausted; resolving the second page forces
        // evict() to pick the first one, which must really be written to
        // swap (not discarded) and its SPTE transitioned to IN_SWAP.
        let second = handle_page_fault(ThreadId(1), 0x6000, &spt, &frames, &swap, &mut pagedir, 0, 0);
        assert_eq!(second, FaultOutcome::Resolved);
        assert!(pagedir.get(0x5000).is_none());
        spt.with_mut(UserPage(0x5000), |e| {
            assert!(matches!(e.state, SpteState::InSwap(_)));
        });
    }
}
