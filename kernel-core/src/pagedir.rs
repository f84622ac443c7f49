//! The page-directory interface consumed by the virtual memory layer.
//!
//! Installing, clearing, and querying user-page mappings is hardware- and
//! architecture-specific (x86-64 vs. RISC-V page tables differ completely);
//! this crate only ever asks the four questions below.

/// A process's page table, as seen by the page-fault handler and the frame
/// table.
pub trait PageDirectory: Send + Sync {
    /// Installs a mapping from user page `upage` to kernel frame `kpage`.
    ///
    /// `writable` controls whether user-mode stores to the page succeed.
    /// Returns `false` if `upage` was already mapped.
    fn install(&mut self, upage: usize, kpage: usize, writable: bool) -> bool;

    /// Removes the mapping for `upage`, if any.
    fn clear(&mut self, upage: usize);

    /// Returns the frame mapped at `upage`, if any.
    fn get(&self, upage: usize) -> Option<usize>;

    /// Returns whether the page at `upage` has been written since it was
    /// mapped (the hardware dirty bit).
    fn is_dirty(&self, upage: usize) -> bool;

    /// Clears the dirty bit for `upage`, if mapped.
    fn clear_dirty(&mut self, upage: usize);
}
