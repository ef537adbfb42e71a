//! # Page directory / page table
//!
//! - [`DirIndex`]: index into the page directory, VA bits `[31:22]`.
//! - [`TableIndex`]: index into a page table, VA bits `[21:12]`.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries; used for both
//!   levels.
//!
//! After modifying active mappings, the caller must perform any required TLB
//! maintenance.

use crate::entry::PageEntry;
use kernel_memory_addresses::VirtualAddress;

/// Entries per directory or table.
pub const ENTRIES: usize = 1024;

/// Index into a page directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirIndex(u16);

/// Index into a page table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl DirIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> 22) as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirIndex, TableIndex) {
    (DirIndex::from(va), TableIndex::from(va))
}

/// A page directory or page table: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

impl PageTable {
    /// Create a fully zeroed table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::new());
    }

    /// Read the entry at `i`.
    ///
    /// Plain load; does not imply any TLB synchronization.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntry {
        self.entries[i]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntry) {
        self.entries[i] = e;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

const _: () = assert!(core::mem::size_of::<PageTable>() == 4096);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_the_address() {
        let (d, t) = split_indices(VirtualAddress::new(0xC040_3123));
        assert_eq!(d.as_usize(), 0x301);
        assert_eq!(t.as_usize(), 0x003);

        let (d, t) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!(d.as_usize(), ENTRIES - 1);
        assert_eq!(t.as_usize(), ENTRIES - 1);
    }

    #[test]
    fn zeroed_table_has_no_present_entries() {
        let mut t = PageTable::zeroed();
        assert_eq!(t.present_count(), 0);
        t.set(5, PageEntry::new().with_present(true));
        assert_eq!(t.present_count(), 1);
        t.zero();
        assert_eq!(t.present_count(), 0);
    }
}
