//! # Address Space (32-bit, directory-rooted)
//!
//! Helpers to build and manipulate a **single** virtual address space: one
//! page directory plus the page tables it points to.
//!
//! - [`AddressSpace::map_one`] installs one 4 KiB mapping, allocating and
//!   zero-filling a missing page table.
//! - [`AddressSpace::unmap_one`] clears one 4 KiB mapping.
//! - [`AddressSpace::query`] translates a VA (handles 4 MiB directory leaves).
//! - [`AddressSpace::copy_kernel_entries`] and
//!   [`AddressSpace::free_user_tables`] set up and tear down process
//!   directories.
//!
//! ## Safety
//!
//! - Mutating active mappings requires TLB maintenance by the caller.
//! - The provided `PhysMapper` must yield **writable** references to table frames.

use crate::entry::{PageEntry, PageFlags};
use crate::table::{ENTRIES, PageTable, split_indices};
use crate::{FrameAlloc, MapError, PhysMapper, info};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    directory: PhysicalAddress,
    mapper: &'m M,
}

/// What [`AddressSpace::map_one`] changed besides the leaf itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapOutcome {
    /// A page table was allocated and linked into the directory.
    pub new_table: bool,
    /// The frame the leaf pointed at before, if it was present.
    pub previous: Option<PhysicalAddress>,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M, directory: PhysicalAddress) -> Self {
        Self { directory, mapper }
    }

    /// Physical address of the page directory.
    #[inline]
    pub const fn directory(&self) -> PhysicalAddress {
        self.directory
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, pa: PhysicalAddress) -> &mut PageTable {
        unsafe { crate::get_table(self.mapper, pa) }
    }

    /// Map **one** 4 KiB page at `va → pa` with `flags`.
    ///
    /// The leaf is always present. A missing page table is taken from
    /// `frames` and zero-filled; its directory entry is writable and gets the
    /// user bit if `flags` asks for it.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if either address is not 4 KiB aligned.
    /// - [`MapError::LargePage`] if `va` is covered by a 4 MiB mapping.
    /// - [`MapError::OutOfMemory`] if no page table could be allocated.
    pub fn map_one<F: FrameAlloc + ?Sized>(
        &self,
        frames: &F,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<MapOutcome, MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned { va, pa });
        }

        let (di, ti) = split_indices(va);
        let dir = self.table_mut(self.directory);
        let pde = dir.get(di.as_usize());

        let (table, new_table) = match pde.address() {
            Some(_) if pde.large_page() => return Err(MapError::LargePage { va }),
            Some(table) => {
                if flags.user() && !pde.user() {
                    dir.set(di.as_usize(), pde.with_user(true));
                }
                (table, false)
            }
            None => {
                let table = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
                self.table_mut(table).zero();
                dir.set(di.as_usize(), PageEntry::table(table, flags.user()));
                (table, true)
            }
        };

        let pt = self.table_mut(table);
        let previous = pt.get(ti.as_usize()).address();
        pt.set(ti.as_usize(), PageEntry::leaf(pa, flags));
        Ok(MapOutcome {
            new_table,
            previous,
        })
    }

    /// Clear the 4 KiB mapping at `va`. Returns the frame it pointed at, or
    /// `None` if nothing was mapped.
    pub fn unmap_one(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (di, ti) = split_indices(va);
        let pde = self.table_mut(self.directory).get(di.as_usize());
        if pde.large_page() {
            return None;
        }
        let pt = self.table_mut(pde.address()?);
        let previous = pt.get(ti.as_usize()).address()?;
        pt.set(ti.as_usize(), PageEntry::new());
        Some(previous)
    }

    /// The leaf entry for `va`, if the walk reaches one.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageEntry> {
        let (di, ti) = split_indices(va);
        let pde = self.table_mut(self.directory).get(di.as_usize());
        pde.address()?;
        if pde.large_page() {
            return Some(pde);
        }
        let pte = self.table_mut(pde.address()?).get(ti.as_usize());
        pte.present().then_some(pte)
    }

    /// Translate a `VirtualAddress` to `PhysicalAddress` if mapped.
    ///
    /// Handles 4 MiB directory leaves by adding the appropriate in-page offset.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.leaf(va)?;
        let base = leaf.address()?;
        if leaf.large_page() {
            Some(base.align_down::<Size4M>() + va.offset::<Size4M>().as_u32())
        } else {
            Some(base + va.offset::<Size4K>().as_u32())
        }
    }

    /// Share the kernel half of `source`: copy every directory entry at and
    /// above [`KERNEL_BASE`](info::KERNEL_BASE).
    pub fn copy_kernel_entries(&self, source: &AddressSpace<'_, M>) {
        let from = source.table_mut(source.directory);
        let to = self.table_mut(self.directory);
        for i in info::USER_DIRECTORY_ENTRIES..ENTRIES {
            to.set(i, from.get(i));
        }
    }

    /// Return every user page table to `frames` and clear its directory
    /// entry. The mapped frames themselves are left alone. Returns the number
    /// of tables freed.
    pub fn free_user_tables<F: FrameAlloc + ?Sized>(&self, frames: &F) -> usize {
        let dir = self.table_mut(self.directory);
        let mut freed = 0;
        for i in 0..info::USER_DIRECTORY_ENTRIES {
            let pde = dir.get(i);
            if let Some(table) = pde.address() {
                if !pde.large_page() {
                    frames.free_4k(table);
                    freed += 1;
                }
                dir.set(i, PageEntry::new());
            }
        }
        log::trace!("freed {freed} user page tables of directory {}", self.directory);
        freed
    }
}
