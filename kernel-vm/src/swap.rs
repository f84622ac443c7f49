//! The swap area (§4.7): a bitmap of page-sized slots over a block device,
//! grounded on the same bit-twiddling as [`kernel_fs::FreeMap`] but over
//! whole pages instead of sectors.

use kernel_core::{
    block::BlockDevice,
    config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE},
    error::KernelError,
    sync::SpinLock,
};

struct SwapState {
    bits: alloc::vec::Vec<u64>,
    slot_count: usize,
}

impl SwapState {
    fn is_free(&self, slot: usize) -> bool {
        self.bits[slot / 64] & (1 << (slot % 64)) == 0
    }

    fn set(&mut self, slot: usize) {
        self.bits[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.bits[slot / 64] &= !(1 << (slot % 64));
    }
}

/// A page-granular swap device (§4.7). `swap_out` finds and claims a free
/// slot and writes the frame across its sectors; `swap_in` reads it back
/// and frees the slot; `free_swap` frees the slot without reading it back
/// (used when a swapped page is discarded, e.g. process teardown).
pub struct SwapArea<D: BlockDevice> {
    device: D,
    state: SpinLock<SwapState>,
}

impl<D: BlockDevice> SwapArea<D> {
    /// Creates a swap area over `device`, sized for `slot_count` page-sized
    /// slots (the device must have at least `slot_count * SECTORS_PER_PAGE`
    /// sectors).
    pub fn new(device: D, slot_count: usize) -> Self {
        let words = slot_count.div_ceil(64);
        SwapArea {
            device,
            state: SpinLock::new(SwapState {
                bits: alloc::vec![0u64; words],
                slot_count,
            }),
        }
    }

    /// Writes `frame` (exactly one page) to a freshly claimed slot,
    /// returning its index.
    pub fn swap_out(&self, frame: &[u8]) -> Result<usize, KernelError> {
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        let mut state = self.state.lock();
        let slot = (0..state.slot_count).find(|&s| state.is_free(s));
        let slot = match slot {
            Some(s) => {
                state.set(s);
                s
            }
            None => {
                state.unlock();
                return Err(KernelError::NoSpace);
            }
        };
        state.unlock();

        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&frame[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device
                .write_sector((slot * SECTORS_PER_PAGE + i) as u32, &sector);
        }
        Ok(slot)
    }

    /// Reads slot `slot` back into `frame` and frees the slot.
    pub fn swap_in(&self, slot: usize, frame: &mut [u8]) {
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            self.device
                .read_sector((slot * SECTORS_PER_PAGE + i) as u32, &mut sector);
            frame[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        let mut state = self.state.lock();
        state.clear(slot);
        state.unlock();
    }

    /// Frees `slot` without reading its contents back.
    pub fn free_swap(&self, slot: usize) {
        let mut state = self.state.lock();
        state.clear(slot);
        state.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{sync::Arc, vec::Vec};
    use kernel_core::sync::SpinLock as CoreSpinLock;

    struct MemDevice {
        sectors: CoreSpinLock<Vec<[u8; SECTOR_SIZE]>>,
    }

    impl MemDevice {
        fn new(n: usize) -> Arc<Self> {
            Arc::new(MemDevice {
                sectors: CoreSpinLock::new(alloc::vec![[0u8; SECTOR_SIZE]; n]),
            })
        }
    }

    impl BlockDevice for Arc<MemDevice> {
        fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
            let guard = self.sectors.lock();
            *buf = guard[sector as usize];
            guard.unlock();
        }
        fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
            let mut guard = self.sectors.lock();
            guard[sector as usize] = *buf;
            guard.unlock();
        }
    }

    #[test]
    fn swap_out_then_in_roundtrips() {
        let dev = MemDevice::new(SECTORS_PER_PAGE * 4);
        let area = SwapArea::new(dev, 4);
        let page = alloc::vec![0x5au8; PAGE_SIZE];
        let slot = area.swap_out(&page).unwrap();
        let mut out = alloc::vec![0u8; PAGE_SIZE];
        area.swap_in(slot, &mut out);
        assert_eq!(out, page);
    }

    #[test]
    fn swap_in_frees_the_slot_for_reuse() {
        let dev = MemDevice::new(SECTORS_PER_PAGE * 2);
        let area = SwapArea::new(dev, 2);
        let page = alloc::vec![1u8; PAGE_SIZE];
        let s1 = area.swap_out(&page).unwrap();
        let mut scratch = alloc::vec![0u8; PAGE_SIZE];
        area.swap_in(s1, &mut scratch);
        let s2 = area.swap_out(&page).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let dev = MemDevice::new(SECTORS_PER_PAGE);
        let area = SwapArea::new(dev, 1);
        let page = alloc::vec![1u8; PAGE_SIZE];
        area.swap_out(&page).unwrap();
        assert!(matches!(area.swap_out(&page), Err(KernelError::NoSpace)));
    }

    #[test]
    fn free_swap_releases_without_reading() {
        let dev = MemDevice::new(SECTORS_PER_PAGE);
        let area = SwapArea::new(dev, 1);
        let page = alloc::vec![1u8; PAGE_SIZE];
        let slot = area.swap_out(&page).unwrap();
        area.free_swap(slot);
        assert!(area.swap_out(&page).is_ok());
    }
}
