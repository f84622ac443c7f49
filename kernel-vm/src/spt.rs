//! The supplemental page table (§4.6): a per-process map from user page to
//! its SPTE, the state machine that drives [`crate::fault::handle_page_fault`].

use crate::{
    UserPage,
    frame::{EvictionWriteback, KernelVirtualAddress, Resident},
    mmap::Backing,
};
use alloc::sync::Arc;
use alloc::collections::BTreeMap;
use core::cell::RefCell;
use kernel_core::{pagedir::PageDirectory, sync::SpinLock};

/// The backing store for one user page, and where its contents currently
/// live.
#[derive(Clone)]
pub enum SpteState {
    /// Resident in a physical frame.
    InFrame(KernelVirtualAddress),
    /// Evicted to a swap slot.
    InSwap(usize),
    /// Lazily backed by a byte range of a file, not yet faulted in.
    Fsys {
        /// The file this page is backed by, read on fault-in and (if
        /// dirty) written back on eviction or munmap.
        file: Arc<dyn Backing>,
        /// Byte offset within the file this page starts at.
        offset: usize,
        /// Bytes to copy from the file before zero-filling the remainder.
        read_bytes: usize,
        /// Bytes to zero-fill after `read_bytes`.
        zero_bytes: usize,
    },
    /// Demand-zero page, never yet touched.
    AllZero,
}

/// One supplemental page table entry: where a user page's data lives, plus
/// the writable bit the page-fault handler installs it with.
pub struct Spte {
    /// Current backing-store state.
    pub state: SpteState,
    /// Whether the page should be installed writable once resident.
    pub writable: bool,
    /// Set once the page has been dirtied, independent of the page
    /// directory's own dirty bit (used for FSYS pages evicted before a
    /// page directory mapping existed to check).
    pub dirty: bool,
}

/// Per-process `UserPage -> Spte` map (§5: owned by the process, not a
/// shared lock — the `SpinLock` here only protects concurrent syscalls and
/// the fault handler racing within the same process).
pub struct SupplementalPageTable {
    entries: SpinLock<BTreeMap<UserPage, Spte>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        SupplementalPageTable {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Installs an already-resident mapping (stack growth, load-time zero
    /// pages already realized as a frame).
    pub fn make_spte(&self, upage: UserPage, frame: KernelVirtualAddress, writable: bool) {
        self.insert(
            upage,
            Spte {
                state: SpteState::InFrame(frame),
                writable,
                dirty: false,
            },
        );
    }

    /// Installs a demand-zero mapping (e.g., BSS pages, fresh mmap past a
    /// file's length).
    pub fn make_spte_zero(&self, upage: UserPage, writable: bool) {
        self.insert(
            upage,
            Spte {
                state: SpteState::AllZero,
                writable,
                dirty: false,
            },
        );
    }

    /// Installs a lazy file-backed mapping.
    pub fn make_spte_filesys(
        &self,
        upage: UserPage,
        file: Arc<dyn Backing>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        self.insert(
            upage,
            Spte {
                state: SpteState::Fsys {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                },
                writable,
                dirty: false,
            },
        );
    }

    fn insert(&self, upage: UserPage, spte: Spte) {
        let mut entries = self.entries.lock();
        entries.insert(upage, spte);
        entries.unlock();
    }

    /// Transitions an existing entry to `InSwap(slot)`, e.g. after eviction
    /// writes its frame out.
    pub fn mark_swapped(&self, upage: UserPage, slot: usize) {
        let mut entries = self.entries.lock();
        if let Some(spte) = entries.get_mut(&upage) {
            spte.state = SpteState::InSwap(slot);
        }
        entries.unlock();
    }

    /// Removes the entry for `upage`, returning it if present. Does not
    /// itself free the frame or swap slot; callers (frame table, mmap
    /// teardown) do that based on the returned state.
    pub fn remove(&self, upage: UserPage) -> Option<Spte> {
        let mut entries = self.entries.lock();
        let spte = entries.remove(&upage);
        entries.unlock();
        spte
    }

    /// Runs `f` with exclusive access to the entry for `upage`, if any.
    pub fn with_mut<R>(&self, upage: UserPage, f: impl FnOnce(&mut Spte) -> R) -> Option<R> {
        let mut entries = self.entries.lock();
        let result = entries.get_mut(&upage).map(f);
        entries.unlock();
        result
    }

    /// True if `upage` has an entry.
    pub fn contains(&self, upage: UserPage) -> bool {
        let entries = self.entries.lock();
        let has = entries.contains_key(&upage);
        entries.unlock();
        has
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Resident`] bound to one page of a live supplemental page table, used
/// by the page-fault handler to give eviction a real victim to consult
/// instead of discarding its contents.
///
/// This crate keeps no registry mapping a [`kernel_core::thread::ThreadId`]
/// to another process's page table, so a resident can only be built for a
/// page in the address space the caller itself already holds `spt` and
/// `pagedir` for. Eviction chosen from within that same process's faults is
/// handled correctly; a victim belonging to a different process falls back
/// to `spt`/`pagedir` lookups that simply find nothing and default to a
/// plain swap-out, which is still correct (never stale), just not backed
/// by that other process's own bookkeeping.
pub struct SpteResident<'a> {
    spt: &'a SupplementalPageTable,
    upage: UserPage,
    pagedir: RefCell<&'a mut dyn PageDirectory>,
}

impl<'a> SpteResident<'a> {
    /// Binds a resident handle for `upage` within `spt`/`pagedir`.
    pub fn new(spt: &'a SupplementalPageTable, upage: UserPage, pagedir: &'a mut dyn PageDirectory) -> Self {
        SpteResident {
            spt,
            upage,
            pagedir: RefCell::new(pagedir),
        }
    }
}

impl Resident for SpteResident<'_> {
    fn writeback(&self) -> EvictionWriteback {
        self.spt
            .with_mut(self.upage, |e| match e.state {
                SpteState::Fsys { .. } => EvictionWriteback::ToFile,
                _ => EvictionWriteback::ToSwap,
            })
            .unwrap_or(EvictionWriteback::ToSwap)
    }

    fn is_dirty(&self) -> bool {
        let spte_dirty = self.spt.with_mut(self.upage, |e| e.dirty).unwrap_or(false);
        spte_dirty || self.pagedir.borrow().is_dirty(self.upage.addr())
    }

    fn unmap(&self) {
        self.pagedir.borrow_mut().clear(self.upage.addr());
    }

    fn write_to_file(&self, frame: &[u8]) {
        self.spt.with_mut(self.upage, |e| {
            if let SpteState::Fsys { file, offset, .. } = &e.state {
                file.write_at(*offset, frame);
            }
        });
    }

    fn mark_swapped(&self, slot: usize) {
        self.spt.mark_swapped(self.upage, slot);
    }
}
