//! The buffer cache (§4.1): a 64-entry write-back cache of sectors behind a
//! single lock. Every sector-granular read or write anywhere in this crate
//! funnels through [`BufferCache`].

use kernel_core::{
    block::BlockDevice,
    config::{CACHE_SIZE, SECTOR_SIZE},
    sync::SpinLock,
};

#[derive(Clone, Copy)]
struct Entry {
    occupied: bool,
    dirty: bool,
    sector_no: u32,
    payload: [u8; SECTOR_SIZE],
}

impl Entry {
    const fn empty() -> Self {
        Entry {
            occupied: false,
            dirty: false,
            sector_no: 0,
            payload: [0u8; SECTOR_SIZE],
        }
    }
}

struct CacheState {
    entries: [Entry; CACHE_SIZE],
}

/// A 64-entry write-back cache of fixed-size sectors over a [`BlockDevice`].
///
/// All operations serialize on a single internal lock (`cache_lock` in the
/// spec's concurrency model, §5). There is no read-ahead and no
/// write-behind: `write` only marks an entry dirty, and `flush` is the only
/// thing that pushes dirty entries back to the device (besides eviction,
/// which writes back a dirty victim before reuse).
pub struct BufferCache<D: BlockDevice> {
    device: D,
    state: SpinLock<CacheState>,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Creates an empty cache over `device`.
    pub fn new(device: D) -> Self {
        BufferCache {
            device,
            state: SpinLock::new(CacheState {
                entries: [Entry::empty(); CACHE_SIZE],
            }),
        }
    }

    /// Copies the contents of `sector` into `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let mut state = self.state.lock();
        let idx = self.find_or_load(&mut state, sector);
        dst.copy_from_slice(&state.entries[idx].payload);
        state.unlock();
    }

    /// Overwrites the contents of `sector` with `src` and marks it dirty.
    pub fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut state = self.state.lock();
        let idx = self.find_or_load(&mut state, sector);
        state.entries[idx].payload.copy_from_slice(src);
        state.entries[idx].dirty = true;
        state.unlock();
    }

    /// Writes every dirty entry back to the device and clears its dirty bit.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        for entry in state.entries.iter_mut() {
            if entry.occupied && entry.dirty {
                self.device.write_sector(entry.sector_no, &entry.payload);
                entry.dirty = false;
            }
        }
        state.unlock();
    }

    /// Finds the entry for `sector`, loading or evicting as needed. Must be
    /// called with `state` already locked; returns the entry's index.
    fn find_or_load(&self, state: &mut CacheState, sector: u32) -> usize {
        if let Some(idx) = state
            .entries
            .iter()
            .position(|e| e.occupied && e.sector_no == sector)
        {
            return idx;
        }

        let idx = match state.entries.iter().position(|e| !e.occupied) {
            Some(idx) => idx,
            None => self.evict(state),
        };

        let mut payload = [0u8; SECTOR_SIZE];
        self.device.read_sector(sector, &mut payload);
        state.entries[idx] = Entry {
            occupied: true,
            dirty: false,
            sector_no: sector,
            payload,
        };
        idx
    }

    /// Scan-from-start victim selection (§4.1): the first occupied slot,
    /// written back first if dirty.
    fn evict(&self, state: &mut CacheState) -> usize {
        let idx = state
            .entries
            .iter()
            .position(|e| e.occupied)
            .expect("evict() called on a cache with no occupied entries");
        let victim = &mut state.entries[idx];
        if victim.dirty {
            self.device.write_sector(victim.sector_no, &victim.payload);
        }
        victim.occupied = false;
        victim.dirty = false;
        idx
    }
}
