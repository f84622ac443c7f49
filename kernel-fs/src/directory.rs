//! The directory layer (§4.4): a directory is an inode whose body is a flat
//! array of fixed-size entries, with entry 0 reserved as the parent
//! back-link.

use crate::inode::{Inode, InodeKind, InodeTable};
use alloc::{string::String, sync::Arc};
use kernel_core::{
    block::BlockDevice,
    config::{NAME_MAX, ROOT_DIR_SECTOR},
    error::KernelError,
};

const NAME_FIELD: usize = NAME_MAX + 1;
const ENTRY_SIZE: usize = 4 + NAME_FIELD + 1;

#[derive(Clone, Copy)]
struct RawEntry {
    inode_sector: u32,
    name: [u8; NAME_FIELD],
    in_use: bool,
}

impl RawEntry {
    fn empty() -> Self {
        RawEntry {
            inode_sector: 0,
            name: [0u8; NAME_FIELD],
            in_use: false,
        }
    }

    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.inode_sector.to_le_bytes());
        out[4..4 + NAME_FIELD].copy_from_slice(&self.name);
        out[4 + NAME_FIELD] = self.in_use as u8;
        out
    }

    fn from_bytes(buf: &[u8; ENTRY_SIZE]) -> Self {
        let inode_sector = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let mut name = [0u8; NAME_FIELD];
        name.copy_from_slice(&buf[4..4 + NAME_FIELD]);
        RawEntry {
            inode_sector,
            name,
            in_use: buf[4 + NAME_FIELD] != 0,
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) -> Result<(), KernelError> {
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        self.name = [0u8; NAME_FIELD];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }
}

/// An open directory: an inode plus the table needed to read/write its
/// entries and to open child inodes.
pub struct Directory<D: BlockDevice> {
    table: Arc<InodeTable<D>>,
    inode: Arc<Inode>,
}

impl<D: BlockDevice> Directory<D> {
    /// Formats a fresh, empty directory inode at `sector`, sized for
    /// `entry_cnt` entries (including the reserved entry 0), with its
    /// parent back-link initially pointing at itself.
    pub fn create(table: &Arc<InodeTable<D>>, sector: u32, entry_cnt: usize) -> Result<(), KernelError> {
        table.create(sector, InodeKind::Directory)?;
        let inode = table.open(sector)?;
        let length = entry_cnt * ENTRY_SIZE;
        if length > ENTRY_SIZE {
            table.write_at(&inode, &alloc::vec![0u8; length - ENTRY_SIZE], ENTRY_SIZE)?;
        }
        let back_link = RawEntry {
            inode_sector: sector,
            name: [0u8; NAME_FIELD],
            in_use: false,
        };
        table.write_at(&inode, &back_link.to_bytes(), 0)?;
        table.close(&inode);
        Ok(())
    }

    /// Opens the directory inode at `sector`.
    pub fn open(table: &Arc<InodeTable<D>>, sector: u32) -> Result<Self, KernelError> {
        let inode = table.open(sector)?;
        if inode.kind() != InodeKind::Directory {
            table.close(&inode);
            return Err(KernelError::NotDirectory);
        }
        Ok(Directory {
            table: table.clone(),
            inode,
        })
    }

    /// Closes the directory's inode handle.
    pub fn close(&self) {
        self.table.close(&self.inode);
    }

    /// The sector this directory's inode lives at.
    pub fn sector(&self) -> u32 {
        self.inode.sector()
    }

    fn entry_count(&self) -> usize {
        self.inode.length() / ENTRY_SIZE
    }

    fn read_entry(&self, idx: usize) -> RawEntry {
        let mut buf = [0u8; ENTRY_SIZE];
        self.table.read_at(&self.inode, &mut buf, idx * ENTRY_SIZE);
        RawEntry::from_bytes(&buf)
    }

    fn write_entry(&self, idx: usize, entry: RawEntry) -> Result<(), KernelError> {
        self.table.write_at(&self.inode, &entry.to_bytes(), idx * ENTRY_SIZE)?;
        Ok(())
    }

    fn parent_sector(&self) -> u32 {
        self.read_entry(0).inode_sector
    }

    /// Resolves `name` to a child inode sector. Handles `.` and `..`
    /// specially; otherwise scans entries from index 1.
    pub fn lookup(&self, name: &str) -> Result<u32, KernelError> {
        if name == "." {
            return Ok(self.sector());
        }
        if name == ".." {
            return Ok(self.parent_sector());
        }
        for idx in 1..self.entry_count() {
            let entry = self.read_entry(idx);
            if entry.in_use && entry.name_str() == name {
                return Ok(entry.inode_sector);
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    /// Adds a new entry named `name` pointing at `child_sector`. For a
    /// child directory, also stamps its parent back-link to this directory.
    pub fn add(&self, name: &str, child_sector: u32, kind: InodeKind) -> Result<(), KernelError> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        if self.lookup(name).is_ok() {
            return Err(KernelError::FileExist);
        }

        if kind == InodeKind::Directory {
            let child = self.table.open(child_sector)?;
            let back_link = RawEntry {
                inode_sector: self.sector(),
                name: [0u8; NAME_FIELD],
                in_use: false,
            };
            self.table.write_at(&child, &back_link.to_bytes(), 0)?;
            self.table.close(&child);
        }

        let mut target = None;
        for idx in 1..self.entry_count() {
            if !self.read_entry(idx).in_use {
                target = Some(idx);
                break;
            }
        }
        let idx = target.unwrap_or_else(|| self.entry_count().max(1));

        let mut entry = RawEntry::empty();
        entry.set_name(name)?;
        entry.inode_sector = child_sector;
        entry.in_use = true;
        self.write_entry(idx, entry)
    }

    /// Removes the entry named `name`. Refuses to remove a non-empty
    /// child directory.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        for idx in 1..self.entry_count() {
            let entry = self.read_entry(idx);
            if entry.in_use && entry.name_str() == name {
                let child = self.table.open(entry.inode_sector)?;
                if child.kind() == InodeKind::Directory {
                    let child_dir = Directory {
                        table: self.table.clone(),
                        inode: child.clone(),
                    };
                    let has_children = (1..child_dir.entry_count()).any(|i| child_dir.read_entry(i).in_use);
                    if has_children {
                        self.table.close(&child);
                        return Err(KernelError::DirectoryNotEmpty);
                    }
                }
                let mut cleared = entry;
                cleared.in_use = false;
                self.write_entry(idx, cleared)?;
                child.remove();
                self.table.close(&child);
                return Ok(());
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    /// Resolves a `/`-separated path to the directory it names, starting
    /// from the root if `path` begins with `/` and from `cwd_sector`
    /// otherwise. Empty components (leading, trailing, or repeated `/`)
    /// are skipped. Fails with `KernelError::NoSuchEntry` if any
    /// component is absent or if the final directory has been removed.
    pub fn dir_open_path(table: &Arc<InodeTable<D>>, cwd_sector: u32, path: &str) -> Result<Self, KernelError> {
        let start_sector = if path.starts_with('/') { ROOT_DIR_SECTOR } else { cwd_sector };
        let mut current = Directory::open(table, start_sector)?;

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let next_sector = match current.lookup(component) {
                Ok(sector) => sector,
                Err(err) => {
                    current.close();
                    return Err(err);
                }
            };
            let next = Directory::open(table, next_sector);
            current.close();
            current = next?;
        }

        if current.inode.is_removed() {
            current.close();
            return Err(KernelError::NoSuchEntry);
        }
        Ok(current)
    }

    /// Advances `cursor` (an entry index, starting at 1) to the next
    /// in-use entry, returning its name. Returns `None` at the end.
    pub fn readdir(&self, cursor: &mut usize) -> Option<String> {
        if *cursor < 1 {
            *cursor = 1;
        }
        while *cursor < self.entry_count() {
            let entry = self.read_entry(*cursor);
            *cursor += 1;
            if entry.in_use {
                return Some(String::from(entry.name_str()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::BufferCache, freemap::FreeMap};
    use alloc::vec::Vec;
    use kernel_core::{
        config::SECTOR_SIZE,
        sync::SpinLock,
    };

    struct MemDevice {
        sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
    }

    impl MemDevice {
        fn new(n: usize) -> Arc<Self> {
            Arc::new(MemDevice {
                sectors: SpinLock::new(alloc::vec![[0u8; SECTOR_SIZE]; n]),
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

    fn harness(sectors: usize) -> Arc<InodeTable<Arc<MemDevice>>> {
        let dev = MemDevice::new(sectors);
        let cache = Arc::new(BufferCache::new(dev));
        let mut fm = FreeMap::new(sectors);
        fm.mark_allocated(0);
        fm.mark_allocated(1);
        Arc::new(InodeTable::new(cache, Arc::new(SpinLock::new(fm))))
    }

    #[test]
    fn root_directory_self_parent() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        assert_eq!(root.lookup(".").unwrap(), 1);
        assert_eq!(root.lookup("..").unwrap(), 1);
        root.close();
    }

    #[test]
    fn add_lookup_and_readdir() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        table.create(2, InodeKind::File).unwrap();
        root.add("a.txt", 2, InodeKind::File).unwrap();

        assert_eq!(root.lookup("a.txt").unwrap(), 2);
        assert!(matches!(root.add("a.txt", 2, InodeKind::File), Err(KernelError::FileExist)));

        let mut cursor = 0;
        assert_eq!(root.readdir(&mut cursor).unwrap(), "a.txt");
        assert!(root.readdir(&mut cursor).is_none());
        root.close();
    }

    #[test]
    fn child_directory_gets_back_link() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        Directory::create(&table, 2, 16).unwrap();
        root.add("sub", 2, InodeKind::Directory).unwrap();

        let sub = Directory::open(&table, 2).unwrap();
        assert_eq!(sub.lookup("..").unwrap(), 1);
        sub.close();
        root.close();
    }

    #[test]
    fn remove_refuses_nonempty_directory() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        Directory::create(&table, 2, 16).unwrap();
        root.add("sub", 2, InodeKind::Directory).unwrap();

        let sub = Directory::open(&table, 2).unwrap();
        table.create(3, InodeKind::File).unwrap();
        sub.add("f", 3, InodeKind::File).unwrap();
        sub.close();

        assert!(matches!(root.remove("sub"), Err(KernelError::DirectoryNotEmpty)));
        root.close();
    }

    #[test]
    fn dir_open_path_resolves_absolute_and_relative_nested_paths() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        Directory::create(&table, 2, 16).unwrap();
        root.add("a", 2, InodeKind::Directory).unwrap();
        let a = Directory::open(&table, 2).unwrap();
        Directory::create(&table, 3, 16).unwrap();
        a.add("b", 3, InodeKind::Directory).unwrap();
        a.close();
        root.close();

        let found = Directory::dir_open_path(&table, 1, "/a/b").unwrap();
        assert_eq!(found.sector(), 3);
        found.close();

        let found = Directory::dir_open_path(&table, 2, "b").unwrap();
        assert_eq!(found.sector(), 3);
        found.close();

        let found = Directory::dir_open_path(&table, 3, "../..").unwrap();
        assert_eq!(found.sector(), 1);
        found.close();
    }

    #[test]
    fn dir_open_path_rejects_missing_component() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        assert!(matches!(
            Directory::dir_open_path(&table, 1, "/nope/sub"),
            Err(KernelError::NoSuchEntry)
        ));
    }

    #[test]
    fn dir_open_path_rejects_removed_final_directory() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        Directory::create(&table, 2, 16).unwrap();
        root.add("sub", 2, InodeKind::Directory).unwrap();

        // Keep a handle open on "sub" so removing it marks it removed
        // without releasing its sector, matching the case of a directory
        // unlinked while another thread still has it open.
        let sub = Directory::open(&table, 2).unwrap();
        root.remove("sub").unwrap();
        root.close();

        assert!(matches!(Directory::dir_open_path(&table, 1, "/sub"), Err(KernelError::NoSuchEntry)));
        sub.close();
    }

    #[test]
    fn name_too_long_is_rejected() {
        let table = harness(256);
        Directory::create(&table, 1, 16).unwrap();
        let root = Directory::open(&table, 1).unwrap();
        table.create(2, InodeKind::File).unwrap();
        let long_name = "this_name_is_way_too_long_for_sure";
        assert!(matches!(root.add(long_name, 2, InodeKind::File), Err(KernelError::NameTooLong)));
        root.close();
    }
}
