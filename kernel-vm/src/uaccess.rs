//! User-pointer wrapper types for a syscall dispatcher (§4.10): one-shot
//! read/write accessors that fault in and pin every page a user buffer
//! spans before touching it, and unpin them again once the access
//! completes (even on error).
//!
//! Grounded on `examples/casys-kaist-KeOS/keos/src/syscall/uaccess.rs`'s
//! `UserPtrRO`/`UserPtrWO`/`UserU8SliceRO`/`UserU8SliceWO`/`UserCString`:
//! each wrapper here consumes `self` on read/write for the same reason —
//! a validated-then-stale address must not be reusable (TOCTOU). The
//! teacher's `Task::access_ok` check is represented here as the
//! [`AccessCheck`] trait, supplied by the embedding kernel, since the VMA
//! bookkeeping it consults belongs to that kernel, not to this crate.

use crate::{
    UserPage,
    fault::handle_page_fault,
    frame::{FrameAllocator, FrameTable, KernelVirtualAddress},
    spt::SupplementalPageTable,
    swap::SwapArea,
};
use alloc::{string::String, vec::Vec};
use core::marker::PhantomData;
use kernel_core::{block::BlockDevice, config::PAGE_SIZE, error::KernelError, pagedir::PageDirectory, thread::ThreadId};

/// Validates that `[addr, addr+len)` lies within the calling process's
/// mapped address space and, if `write` is set, is writable. The
/// embedding kernel owns the region/VMA bookkeeping this crate does not
/// model, so it supplies this check.
pub trait AccessCheck {
    /// Returns true if the byte range is accessible with the requested
    /// permission.
    fn access_ok(&self, addr: usize, len: usize, write: bool) -> bool;
}

/// Everything one user-buffer access needs to fault in and pin its
/// spanned pages: the owning process's VM state plus the interfaces
/// `handle_page_fault` itself requires.
pub struct PageFaultContext<'a, A: FrameAllocator, D: BlockDevice> {
    /// The faulting thread, for frame-ownership bookkeeping.
    pub owner: ThreadId,
    /// The process's supplemental page table.
    pub spt: &'a SupplementalPageTable,
    /// The shared frame table.
    pub frames: &'a FrameTable<A>,
    /// The shared swap area.
    pub swap: &'a SwapArea<D>,
    /// The process's page directory.
    pub pagedir: &'a mut dyn PageDirectory,
    /// The user stack pointer at syscall entry, for the stack-growth
    /// heuristic.
    pub esp: usize,
    /// The lowest address of the thread's initial stack page.
    pub stack_bottom: usize,
}

/// Faults in (if necessary) and pins every page spanning `[addr, addr +
/// len)`, returning the pinned frames so the caller can unpin them once
/// its copy is done. On any page failing to resolve, every page pinned
/// so far is unpinned before returning the error.
fn fault_in_and_pin<A: FrameAllocator, D: BlockDevice>(
    addr: usize,
    len: usize,
    ctx: &mut PageFaultContext<A, D>,
) -> Result<Vec<KernelVirtualAddress>, KernelError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let first = UserPage::containing(addr).addr();
    let last = UserPage::containing(addr + len - 1).addr();
    let mut pinned = Vec::new();

    let mut upage = first;
    loop {
        if ctx.pagedir.get(upage).is_none() {
            let outcome = handle_page_fault(
                ctx.owner,
                upage,
                ctx.spt,
                ctx.frames,
                ctx.swap,
                ctx.pagedir,
                ctx.esp,
                ctx.stack_bottom,
            );
            if outcome != crate::fault::FaultOutcome::Resolved {
                for kpage in pinned {
                    ctx.frames.unpin(kpage);
                }
                return Err(KernelError::BadAddress);
            }
        }
        let Some(kpage_addr) = ctx.pagedir.get(upage) else {
            for kpage in pinned {
                ctx.frames.unpin(kpage);
            }
            return Err(KernelError::BadAddress);
        };
        let kpage = KernelVirtualAddress(kpage_addr);
        ctx.frames.pin(kpage);
        pinned.push(kpage);

        if upage == last {
            break;
        }
        upage += PAGE_SIZE;
    }
    Ok(pinned)
}

fn unpin_all<A: FrameAllocator>(frames: &FrameTable<A>, pinned: Vec<KernelVirtualAddress>) {
    for kpage in pinned {
        frames.unpin(kpage);
    }
}

/// A one-time, read-only pointer to a user-space object of type `T`.
pub struct UserPtrRo<T: Copy> {
    addr: usize,
    _ty: PhantomData<T>,
}

impl<T: Copy> UserPtrRo<T> {
    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        UserPtrRo { addr, _ty: PhantomData }
    }

    /// Validates, faults in, pins, and reads the pointee. Consumes `self`
    /// so the checked address cannot be read again without re-validating.
    pub fn get<A: FrameAllocator, D: BlockDevice>(
        self,
        access: &dyn AccessCheck,
        ctx: &mut PageFaultContext<A, D>,
    ) -> Result<T, KernelError> {
        let len = core::mem::size_of::<T>();
        if !access.access_ok(self.addr, len, false) {
            return Err(KernelError::BadAddress);
        }
        let pinned = fault_in_and_pin(self.addr, len, ctx)?;
        let value = unsafe { (self.addr as *const T).read_unaligned() };
        unpin_all(ctx.frames, pinned);
        Ok(value)
    }
}

/// A one-time, write-only pointer to a user-space object of type `T`.
pub struct UserPtrWo<T: Copy> {
    addr: usize,
    _ty: PhantomData<T>,
}

impl<T: Copy> UserPtrWo<T> {
    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        UserPtrWo { addr, _ty: PhantomData }
    }

    /// Validates, faults in, pins, and writes `value`. Consumes `self` so
    /// the checked address cannot be written again without re-validating.
    pub fn put<A: FrameAllocator, D: BlockDevice>(
        self,
        value: T,
        access: &dyn AccessCheck,
        ctx: &mut PageFaultContext<A, D>,
    ) -> Result<(), KernelError> {
        let len = core::mem::size_of::<T>();
        if !access.access_ok(self.addr, len, true) {
            return Err(KernelError::BadAddress);
        }
        let pinned = fault_in_and_pin(self.addr, len, ctx)?;
        unsafe { (self.addr as *mut T).write_unaligned(value) };
        unpin_all(ctx.frames, pinned);
        Ok(())
    }
}

/// A one-time, read-only pointer to a byte slice in user-space.
pub struct UserSliceRo {
    addr: usize,
    len: usize,
}

impl UserSliceRo {
    /// Wraps the user-space range `[addr, addr + len)`.
    pub fn new(addr: usize, len: usize) -> Self {
        UserSliceRo { addr, len }
    }

    /// Validates, faults in, pins, and copies the buffer out. Consumes
    /// `self` so the checked range cannot be read again without
    /// re-validating.
    pub fn get<A: FrameAllocator, D: BlockDevice>(
        self,
        access: &dyn AccessCheck,
        ctx: &mut PageFaultContext<A, D>,
    ) -> Result<Vec<u8>, KernelError> {
        if !access.access_ok(self.addr, self.len, false) {
            return Err(KernelError::BadAddress);
        }
        let pinned = fault_in_and_pin(self.addr, self.len, ctx)?;
        let mut out = alloc::vec![0u8; self.len];
        out.copy_from_slice(unsafe { core::slice::from_raw_parts(self.addr as *const u8, self.len) });
        unpin_all(ctx.frames, pinned);
        Ok(out)
    }
}

/// A one-time, write-only pointer to a byte slice in user-space.
pub struct UserSliceWo {
    addr: usize,
    len: usize,
}

impl UserSliceWo {
    /// Wraps the user-space range `[addr, addr + len)`.
    pub fn new(addr: usize, len: usize) -> Self {
        UserSliceWo { addr, len }
    }

    /// Validates, faults in, pins, and copies `data` in (truncated to
    /// `self.len` if shorter). Consumes `self` so the checked range
    /// cannot be written again without re-validating.
    pub fn put<A: FrameAllocator, D: BlockDevice>(
        self,
        data: &[u8],
        access: &dyn AccessCheck,
        ctx: &mut PageFaultContext<A, D>,
    ) -> Result<usize, KernelError> {
        if !access.access_ok(self.addr, self.len, true) {
            return Err(KernelError::BadAddress);
        }
        let size = self.len.min(data.len());
        let pinned = fault_in_and_pin(self.addr, size, ctx)?;
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.addr as *mut u8, size);
        }
        unpin_all(ctx.frames, pinned);
        Ok(size)
    }
}

/// A pointer to a NUL-terminated string in user-space.
pub struct UserCString {
    addr: usize,
}

impl UserCString {
    /// Wraps the user-space address `addr`.
    pub fn new(addr: usize) -> Self {
        UserCString { addr }
    }

    /// Reads byte by byte until a NUL terminator, validating, faulting in,
    /// and pinning the page of each byte read. Consumes `self` so the
    /// checked address cannot be read again without re-validating.
    pub fn read<A: FrameAllocator, D: BlockDevice>(
        self,
        access: &dyn AccessCheck,
        ctx: &mut PageFaultContext<A, D>,
    ) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut ptr = self.addr;
        loop {
            let byte = UserPtrRo::<u8>::new(ptr).get(access, ctx)?;
            if byte == 0 {
                return core::str::from_utf8(&bytes).map(String::from).map_err(|_| KernelError::InvalidArgument);
            }
            bytes.push(byte);
            ptr += 1;
        }
    }
}
