//! The inode layer (§4.3): on-disk inode layout, the deduplicating
//! open-inode table, and byte-addressed read/write/growth over the buffer
//! cache.

use crate::{cache::BufferCache, freemap::FreeMap};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use kernel_core::{
    block::BlockDevice,
    config::{DIRECT_BLOCKS, INODE_MAGIC, POINTERS_PER_INDIRECT, SECTOR_SIZE},
    error::KernelError,
    sync::{RwLock, SpinLock},
};

/// The type an inode was created as. Directories get their own byte layout
/// (§4.4); plain files are opaque byte streams.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

impl InodeKind {
    fn to_u32(self) -> u32 {
        match self {
            InodeKind::File => 0,
            InodeKind::Directory => 1,
        }
    }

    fn from_u32(v: u32) -> Result<Self, KernelError> {
        match v {
            0 => Ok(InodeKind::File),
            1 => Ok(InodeKind::Directory),
            _ => Err(KernelError::FilesystemCorrupted("inode type")),
        }
    }
}

/// The exact 512-byte on-disk inode image (§6).
#[repr(C)]
#[derive(Clone, Copy)]
struct DiskInode {
    direct: [u32; DIRECT_BLOCKS],
    indirect: u32,
    doubly_indirect: u32,
    kind: u32,
    length: i32,
    magic: u32,
}

impl DiskInode {
    fn to_bytes(self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        let mut off = 0;
        for d in self.direct.iter() {
            out[off..off + 4].copy_from_slice(&d.to_le_bytes());
            off += 4;
        }
        out[off..off + 4].copy_from_slice(&self.indirect.to_le_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.doubly_indirect.to_le_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.kind.to_le_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.length.to_le_bytes());
        off += 4;
        out[off..off + 4].copy_from_slice(&self.magic.to_le_bytes());
        out
    }

    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Result<Self, KernelError> {
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut off = 0;
        for d in direct.iter_mut() {
            *d = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let indirect = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let doubly_indirect = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let kind = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let length = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let magic = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
        }
        Ok(DiskInode {
            direct,
            indirect,
            doubly_indirect,
            kind,
            length,
            magic,
        })
    }
}

fn sectors_for_length(length: usize) -> usize {
    length.div_ceil(SECTOR_SIZE)
}

/// Translates a byte offset into its data sector, per the three-tier
/// direct/single-indirect/doubly-indirect layout.
fn byte_to_sector<D: BlockDevice>(
    cache: &BufferCache<D>,
    disk: &DiskInode,
    pos: usize,
) -> Option<u32> {
    if pos >= disk.length.max(0) as usize {
        return None;
    }
    let idx = pos / SECTOR_SIZE;
    if idx < DIRECT_BLOCKS {
        return Some(disk.direct[idx]);
    }
    let idx = idx - DIRECT_BLOCKS;
    if idx < POINTERS_PER_INDIRECT {
        if disk.indirect == 0 {
            return Some(0);
        }
        return Some(read_indirect_entry(cache, disk.indirect, idx));
    }
    let idx = idx - POINTERS_PER_INDIRECT;
    if disk.doubly_indirect == 0 {
        return Some(0);
    }
    let outer = idx / POINTERS_PER_INDIRECT;
    let inner = idx % POINTERS_PER_INDIRECT;
    let mid = read_indirect_entry(cache, disk.doubly_indirect, outer);
    if mid == 0 {
        return Some(0);
    }
    Some(read_indirect_entry(cache, mid, inner))
}

fn read_indirect_entry<D: BlockDevice>(cache: &BufferCache<D>, sector: u32, idx: usize) -> u32 {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf);
    u32::from_le_bytes(buf[idx * 4..idx * 4 + 4].try_into().unwrap())
}

fn write_indirect_entry<D: BlockDevice>(cache: &BufferCache<D>, sector: u32, idx: usize, value: u32) {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf);
    buf[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
    cache.write(sector, &buf);
}

/// Allocates a fresh sector, zeroes it, writes the zeroed image through the
/// cache, and returns its number. Used both for data sectors and indirect
/// blocks, which start life all-zero pointers.
fn alloc_zeroed<D: BlockDevice>(
    cache: &BufferCache<D>,
    free_map: &SpinLock<FreeMap>,
) -> Result<u32, KernelError> {
    let mut fm = free_map.lock();
    let sector = fm.allocate(1);
    fm.unlock();
    let sector = sector?;
    cache.write(sector, &[0u8; SECTOR_SIZE]);
    Ok(sector)
}

/// Extends `disk`'s allocation so that it covers `new_length` bytes,
/// allocating zeroed sectors (and indirect blocks) as needed. Idempotent:
/// re-running with the same `new_length` touches nothing.
///
/// Per the open question on growth failure (§9): if an allocation partway
/// through fails, every sector this call allocated is released before the
/// error is returned, so the inode is left exactly as it was found.
fn grow<D: BlockDevice>(
    cache: &BufferCache<D>,
    free_map: &SpinLock<FreeMap>,
    disk: &mut DiskInode,
    new_length: usize,
) -> Result<(), KernelError> {
    let target_sectors = sectors_for_length(new_length);
    let mut allocated_here: Vec<u32> = Vec::new();

    let result = (|| -> Result<(), KernelError> {
        for idx in 0..target_sectors.min(DIRECT_BLOCKS) {
            if disk.direct[idx] == 0 {
                let s = alloc_zeroed(cache, free_map)?;
                allocated_here.push(s);
                disk.direct[idx] = s;
            }
        }
        if target_sectors <= DIRECT_BLOCKS {
            return Ok(());
        }

        let indirect_needed = target_sectors - DIRECT_BLOCKS;
        if disk.indirect == 0 {
            let s = alloc_zeroed(cache, free_map)?;
            allocated_here.push(s);
            disk.indirect = s;
        }
        for idx in 0..indirect_needed.min(POINTERS_PER_INDIRECT) {
            if read_indirect_entry(cache, disk.indirect, idx) == 0 {
                let s = alloc_zeroed(cache, free_map)?;
                allocated_here.push(s);
                write_indirect_entry(cache, disk.indirect, idx, s);
            }
        }
        if indirect_needed <= POINTERS_PER_INDIRECT {
            return Ok(());
        }

        let doubly_needed = indirect_needed - POINTERS_PER_INDIRECT;
        if disk.doubly_indirect == 0 {
            let s = alloc_zeroed(cache, free_map)?;
            allocated_here.push(s);
            disk.doubly_indirect = s;
        }
        let outer_count = doubly_needed.div_ceil(POINTERS_PER_INDIRECT);
        for outer in 0..outer_count {
            let mut mid = read_indirect_entry(cache, disk.doubly_indirect, outer);
            if mid == 0 {
                let s = alloc_zeroed(cache, free_map)?;
                allocated_here.push(s);
                write_indirect_entry(cache, disk.doubly_indirect, outer, s);
                mid = s;
            }
            let remaining = doubly_needed - outer * POINTERS_PER_INDIRECT;
            let inner_count = remaining.min(POINTERS_PER_INDIRECT);
            for inner in 0..inner_count {
                if read_indirect_entry(cache, mid, inner) == 0 {
                    let s = alloc_zeroed(cache, free_map)?;
                    allocated_here.push(s);
                    write_indirect_entry(cache, mid, inner, s);
                }
            }
        }
        Ok(())
    })();

    if result.is_err() {
        let mut fm = free_map.lock();
        for s in allocated_here {
            fm.release(s, 1);
        }
        fm.unlock();
    }
    result
}

/// Releases every data sector, indirect block, and doubly-indirect block
/// owned by `disk`, plus `inode_sector` itself.
fn release_all<D: BlockDevice>(cache: &BufferCache<D>, free_map: &SpinLock<FreeMap>, disk: &DiskInode, inode_sector: u32) {
    let mut fm = free_map.lock();
    let sector_count = sectors_for_length(disk.length.max(0) as usize);

    for idx in 0..sector_count.min(DIRECT_BLOCKS) {
        if disk.direct[idx] != 0 {
            fm.release(disk.direct[idx], 1);
        }
    }
    if disk.indirect != 0 {
        if sector_count > DIRECT_BLOCKS {
            let indirect_used = (sector_count - DIRECT_BLOCKS).min(POINTERS_PER_INDIRECT);
            for idx in 0..indirect_used {
                let s = read_indirect_entry(cache, disk.indirect, idx);
                if s != 0 {
                    fm.release(s, 1);
                }
            }
        }
        fm.release(disk.indirect, 1);
    }
    if disk.doubly_indirect != 0 {
        if sector_count > DIRECT_BLOCKS + POINTERS_PER_INDIRECT {
            let doubly_used = sector_count - DIRECT_BLOCKS - POINTERS_PER_INDIRECT;
            let outer_count = doubly_used.div_ceil(POINTERS_PER_INDIRECT);
            for outer in 0..outer_count {
                let mid = read_indirect_entry(cache, disk.doubly_indirect, outer);
                if mid == 0 {
                    continue;
                }
                let remaining = doubly_used - outer * POINTERS_PER_INDIRECT;
                let inner_count = remaining.min(POINTERS_PER_INDIRECT);
                for inner in 0..inner_count {
                    let s = read_indirect_entry(cache, mid, inner);
                    if s != 0 {
                        fm.release(s, 1);
                    }
                }
                fm.release(mid, 1);
            }
        }
        fm.release(disk.doubly_indirect, 1);
    }
    fm.release(inode_sector, 1);
    fm.unlock();
}

struct InodeState {
    disk: DiskInode,
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// An open inode: reference-counted, deduplicated by sector number across
/// every open in the system.
pub struct Inode {
    sector: u32,
    state: SpinLock<InodeState>,
}

impl Inode {
    /// The sector this inode is stored at.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// The inode's type.
    pub fn kind(&self) -> InodeKind {
        let state = self.state.lock();
        let kind = InodeKind::from_u32(state.disk.kind).unwrap();
        state.unlock();
        kind
    }

    /// Current length in bytes.
    pub fn length(&self) -> usize {
        let state = self.state.lock();
        let len = state.disk.length.max(0) as usize;
        state.unlock();
        len
    }

    /// Increments the deny-write counter; while positive, writes are no-ops.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_count += 1;
        debug_assert!(state.deny_write_count <= state.open_count);
        state.unlock();
    }

    /// Decrements the deny-write counter.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.deny_write_count > 0);
        state.deny_write_count -= 1;
        state.unlock();
    }

    /// Marks the inode for deletion; the backing sectors are released once
    /// the last open handle closes.
    pub fn remove(&self) {
        let mut state = self.state.lock();
        state.removed = true;
        state.unlock();
    }

    /// Whether [`remove`](Self::remove) has been called.
    pub fn is_removed(&self) -> bool {
        let state = self.state.lock();
        let r = state.removed;
        state.unlock();
        r
    }
}

/// The deduplicating open-inode table (§4.3, `open_inodes_lock` in §5): at
/// most one in-memory [`Inode`] exists per sector at a time.
pub struct InodeTable<D: BlockDevice> {
    cache: Arc<BufferCache<D>>,
    free_map: Arc<SpinLock<FreeMap>>,
    open: RwLock<BTreeMap<u32, Arc<Inode>>>,
}

impl<D: BlockDevice> InodeTable<D> {
    /// Creates an empty table over `cache`, allocating through `free_map`.
    pub fn new(cache: Arc<BufferCache<D>>, free_map: Arc<SpinLock<FreeMap>>) -> Self {
        InodeTable {
            cache,
            free_map,
            open: RwLock::new(BTreeMap::new()),
        }
    }

    /// Initializes a fresh on-disk inode at `sector` with the given `kind`
    /// and zero length, persisting it through the cache. Does not open it.
    pub fn create(&self, sector: u32, kind: InodeKind) -> Result<(), KernelError> {
        let disk = DiskInode {
            direct: [0u32; DIRECT_BLOCKS],
            indirect: 0,
            doubly_indirect: 0,
            kind: kind.to_u32(),
            length: 0,
            magic: INODE_MAGIC,
        };
        self.cache.write(sector, &disk.to_bytes());
        Ok(())
    }

    /// Opens the inode at `sector`, deduplicating against already-open
    /// handles and incrementing its refcount.
    pub fn open(&self, sector: u32) -> Result<Arc<Inode>, KernelError> {
        {
            let table = self.open.read();
            if let Some(existing) = table.get(&sector) {
                let mut state = existing.state.lock();
                state.open_count += 1;
                state.unlock();
                let found = existing.clone();
                table.unlock();
                return Ok(found);
            }
            table.unlock();
        }

        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf);
        let disk = DiskInode::from_bytes(&buf)?;

        let mut table = self.open.write();
        if let Some(existing) = table.get(&sector) {
            let mut state = existing.state.lock();
            state.open_count += 1;
            state.unlock();
            let found = existing.clone();
            table.unlock();
            return Ok(found);
        }
        let inode = Arc::new(Inode {
            sector,
            state: SpinLock::new(InodeState {
                disk,
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
        });
        table.insert(sector, inode.clone());
        table.unlock();
        Ok(inode)
    }

    /// Closes a handle. On the last close, if the inode was removed, all of
    /// its data and indirect sectors (and the inode sector itself) are
    /// returned to the free map.
    pub fn close(&self, inode: &Arc<Inode>) {
        let (open_count, removed) = {
            let mut state = inode.state.lock();
            state.open_count -= 1;
            let snapshot = (state.open_count, state.removed);
            state.unlock();
            snapshot
        };
        if open_count != 0 {
            return;
        }
        let mut table = self.open.write();
        table.remove(&inode.sector());
        table.unlock();
        if removed {
            let state = inode.state.lock();
            release_all(&self.cache, &self.free_map, &state.disk, inode.sector);
            state.unlock();
        }
    }

    /// Reads up to `dst.len()` bytes starting at `pos`, returning the
    /// number of bytes actually read (short of a read past EOF).
    pub fn read_at(&self, inode: &Arc<Inode>, dst: &mut [u8], pos: usize) -> usize {
        let state = inode.state.lock();
        let disk = state.disk;
        state.unlock();

        let length = disk.length.max(0) as usize;
        if pos >= length {
            return 0;
        }
        let to_read = dst.len().min(length - pos);
        let mut done = 0;
        while done < to_read {
            let cur = pos + done;
            let sector_ofs = cur % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(to_read - done);
            let sector = byte_to_sector(&self.cache, &disk, cur).unwrap_or(0);
            let mut buf = [0u8; SECTOR_SIZE];
            if sector != 0 {
                self.cache.read(sector, &mut buf);
            }
            dst[done..done + chunk].copy_from_slice(&buf[sector_ofs..sector_ofs + chunk]);
            done += chunk;
        }
        done
    }

    /// Writes `src.len()` bytes starting at `pos`, growing the file first if
    /// the write extends past current length. Returns 0 without writing
    /// anything if the inode currently denies writes.
    pub fn write_at(&self, inode: &Arc<Inode>, src: &[u8], pos: usize) -> Result<usize, KernelError> {
        let state = inode.state.lock();
        if state.deny_write_count > 0 {
            state.unlock();
            return Ok(0);
        }
        let mut disk = state.disk;
        state.unlock();

        let end = pos + src.len();
        if end > disk.length.max(0) as usize {
            grow(&self.cache, &self.free_map, &mut disk, end)?;
            disk.length = end as i32;
            self.cache.write(inode.sector, &disk.to_bytes());

            let mut state = inode.state.lock();
            state.disk = disk;
            state.unlock();
        }

        let mut done = 0;
        while done < src.len() {
            let cur = pos + done;
            let sector_ofs = cur % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_ofs).min(src.len() - done);
            let sector = byte_to_sector(&self.cache, &disk, cur)
                .ok_or(KernelError::FilesystemCorrupted("write past mapped length"))?;
            if chunk == SECTOR_SIZE {
                let exact: &[u8; SECTOR_SIZE] = src[done..done + SECTOR_SIZE].try_into().unwrap();
                self.cache.write(sector, exact);
            } else {
                let mut buf = [0u8; SECTOR_SIZE];
                self.cache.read(sector, &mut buf);
                buf[sector_ofs..sector_ofs + chunk].copy_from_slice(&src[done..done + chunk]);
                self.cache.write(sector, &buf);
            }
            done += chunk;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferCache;
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

    fn harness(sectors: usize) -> (Arc<BufferCache<Arc<MemDevice>>>, Arc<SpinLock<FreeMap>>, InodeTable<Arc<MemDevice>>) {
        let dev = MemDevice::new(sectors);
        let cache = Arc::new(BufferCache::new(dev));
        let mut fm = FreeMap::new(sectors);
        fm.mark_allocated(0);
        fm.mark_allocated(1);
        let fm = Arc::new(SpinLock::new(fm));
        let table = InodeTable::new(cache.clone(), fm.clone());
        (cache, fm, table)
    }

    #[test]
    fn create_open_write_read_roundtrip() {
        let (_cache, _fm, table) = harness(1024);
        table.create(2, InodeKind::File).unwrap();
        let inode = table.open(2).unwrap();
        let payload = alloc::vec![42u8; 3000];
        table.write_at(&inode, &payload, 0).unwrap();
        let mut out = alloc::vec![0u8; 3000];
        let n = table.read_at(&inode, &mut out, 0);
        assert_eq!(n, 3000);
        assert_eq!(out, payload);
        assert_eq!(inode.length(), 3000);
    }

    #[test]
    fn write_spanning_indirect_block() {
        let (_cache, _fm, table) = harness(4096);
        table.create(2, InodeKind::File).unwrap();
        let inode = table.open(2).unwrap();
        let offset = 123 * SECTOR_SIZE + 10;
        table.write_at(&inode, &[9u8; 20], offset).unwrap();
        let mut out = [0u8; 20];
        assert_eq!(table.read_at(&inode, &mut out, offset), 20);
        assert_eq!(out, [9u8; 20]);
    }

    #[test]
    fn open_deduplicates_handles() {
        let (_cache, _fm, table) = harness(128);
        table.create(2, InodeKind::File).unwrap();
        let a = table.open(2).unwrap();
        let b = table.open(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        table.close(&a);
        table.close(&b);
    }

    #[test]
    fn deny_write_makes_writes_no_ops() {
        let (_cache, _fm, table) = harness(128);
        table.create(2, InodeKind::File).unwrap();
        let inode = table.open(2).unwrap();
        inode.deny_write();
        let n = table.write_at(&inode, &[1, 2, 3], 0).unwrap();
        assert_eq!(n, 0);
        assert_eq!(inode.length(), 0);
    }

    #[test]
    fn growth_failure_is_rolled_back() {
        let (_cache, fm, table) = harness(10);
        table.create(2, InodeKind::File).unwrap();
        let inode = table.open(2).unwrap();
        let free_before = {
            let mut guard = fm.lock();
            let mut count = 0;
            for i in 0..10 {
                if guard.allocate(1).is_ok() {
                    count += 1;
                } else {
                    break;
                }
            }
            guard.unlock();
            count
        };
        // exhausted the free map ourselves; any further growth must fail
        // and leave the inode's length untouched.
        let _ = free_before;
        let err = table.write_at(&inode, &[1u8; SECTOR_SIZE * 2], 0);
        assert!(err.is_err());
        assert_eq!(inode.length(), 0);
    }

    #[test]
    fn remove_releases_sectors_on_last_close() {
        let (_cache, fm, table) = harness(128);
        table.create(2, InodeKind::File).unwrap();
        let inode = table.open(2).unwrap();
        table.write_at(&inode, &[1u8; SECTOR_SIZE], 0).unwrap();
        inode.remove();
        table.close(&inode);
        let mut guard = fm.lock();
        let start = guard.allocate(1).unwrap();
        guard.unlock();
        assert!(start < 128);
    }
}
