//! # Virtual Memory Support
//!
//! 32-bit two-level x86 paging for the kernel core.
//!
//! ## What you get
//! - [`PageEntry`]: the entry format shared by directories and tables, and
//!   [`PageFlags`], the permission bits callers pass in.
//! - A 4 KiB-aligned [`PageTable`] and the [`DirIndex`]/[`TableIndex`]
//!   helpers.
//! - An [`AddressSpace`] describing one page directory.
//! - The static kernel region table, [`VmMap`].
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  Dir  | Table | Offset |
//!
//!  CR3 → Page Directory ──► PDE (PS=0) → Page Table ──► PTE → 4 KiB page
//!                      └──► PDE (PS=1) ───────────────────────► 4 MiB page
//! ```
//!
//! Each level has 1024 entries of 4 bytes. Directory entries at and above
//! `KERNEL_BASE` are shared by every address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod entry;
pub mod table;
pub mod vm_map;

pub use crate::address_space::{AddressSpace, MapOutcome};
pub use crate::entry::{PageEntry, PageFlags};
pub use crate::table::{DirIndex, PageTable, TableIndex};
pub use crate::vm_map::{MAX_REGIONS, Region, VmMap};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Why a mapping could not be installed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical memory for a page table")]
    OutOfMemory,
    #[error("{va} -> {pa} is not 4 KiB aligned")]
    Unaligned {
        va: VirtualAddress,
        pa: PhysicalAddress,
    },
    #[error("{va} lies inside a 4 MiB page")]
    LargePage { va: VirtualAddress },
}

/// Source of **physical** 4 KiB frames for page tables and directories.
///
/// Shared between CPUs, so the methods take `&self`; implementations lock
/// internally.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Returns `None` on out-of-memory.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, frame: PhysicalAddress);

    /// Whether the calling CPU holds the allocator's internal lock.
    fn lock_held(&self) -> bool;
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (e.g. through the static kernel window).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable through the mapper and writable.
    /// - The mapping must remain valid for `'a`.
    /// - Type `T` must match the bytes at `pa` (no aliasing UB).
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Map a physical page table frame into the current virtual address space and
/// return a mutable reference to it.
///
/// # Safety
/// - `phys` must point to a valid 4 KiB page containing a page table.
/// - The mapping must be writable for mut access.
#[inline]
unsafe fn get_table<'a, M: PhysMapper + ?Sized>(m: &M, phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::{Cell, UnsafeCell};
    use kernel_memory_addresses::VirtualAddress;
    use std::vec::Vec;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    ///
    /// Freed frames are only counted.
    struct BumpAlloc {
        next: Cell<u32>,
        end: u32,
        freed: Cell<usize>,
    }

    impl BumpAlloc {
        fn new(start: u32, end: u32) -> Self {
            Self {
                next: Cell::new(start),
                end,
                freed: Cell::new(0),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&self) -> Option<PhysicalAddress> {
            let p = self.next.get();
            if p + 4096 > self.end {
                return None;
            }
            self.next.set(p + 4096);
            Some(PhysicalAddress::new(p))
        }

        fn free_4k(&self, _frame: PhysicalAddress) {
            self.freed.set(self.freed.get() + 1);
        }

        fn lock_held(&self) -> bool {
            false
        }
    }

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(C, align(4096))]
    struct Aligned4K(UnsafeCell<[u8; 4096]>);

    /// Physical memory as a vector of frames; physical address 0 is frame 0.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Aligned4K(UnsafeCell::new([0xAA; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            debug_assert_eq!(pa.as_u32() & 0xFFF, 0);
            unsafe { &mut *self.frames[idx].0.get().cast::<T>() }
        }
    }

    fn space(phys: &TestPhys, alloc: &BumpAlloc) -> PhysicalAddress {
        let dir = alloc.alloc_4k().unwrap();
        unsafe { get_table(phys, dir).zero() };
        dir
    }

    #[test]
    fn map_one_creates_a_zeroed_table_and_leaf() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));

        let va = VirtualAddress::new(0xD000_3000);
        let pa = PhysicalAddress::new(0x0000_7000);
        let outcome = aspace
            .map_one(&alloc, va, pa, PageFlags::KERNEL)
            .expect("map_one");
        assert_eq!(
            outcome,
            MapOutcome {
                new_table: true,
                previous: None
            }
        );

        let dir = unsafe { get_table(&phys, aspace.directory()) };
        let pde = dir.get(DirIndex::from(va).as_usize());
        assert!(pde.present() && pde.writable() && !pde.user());
        let table = unsafe { get_table(&phys, pde.address().unwrap()) };
        // The fresh table was filled with 0xAA garbage before; only our leaf remains.
        assert_eq!(table.present_count(), 1);

        assert_eq!(aspace.query(va + 0x123), Some(pa + 0x123));
        assert!(aspace.leaf(va).unwrap().global());
    }

    #[test]
    fn remapping_reports_the_previous_frame() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));
        let va = VirtualAddress::new(0x0040_0000);

        aspace
            .map_one(&alloc, va, PhysicalAddress::new(0x8000), PageFlags::USER)
            .unwrap();
        let again = aspace
            .map_one(&alloc, va, PhysicalAddress::new(0x9000), PageFlags::USER)
            .unwrap();
        assert_eq!(
            again,
            MapOutcome {
                new_table: false,
                previous: Some(PhysicalAddress::new(0x8000))
            }
        );
        assert_eq!(aspace.query(va), Some(PhysicalAddress::new(0x9000)));
    }

    #[test]
    fn user_leaf_upgrades_an_existing_kernel_table() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));

        aspace
            .map_one(&alloc, VirtualAddress::new(0x0040_0000), PhysicalAddress::new(0x8000), PageFlags::KERNEL)
            .unwrap();
        aspace
            .map_one(&alloc, VirtualAddress::new(0x0040_1000), PhysicalAddress::new(0x9000), PageFlags::USER)
            .unwrap();
        let dir = unsafe { get_table(&phys, aspace.directory()) };
        assert!(dir.get(1).user());
    }

    #[test]
    fn misaligned_and_exhausted_maps_fail() {
        let phys = TestPhys::with_frames(2);
        let alloc = BumpAlloc::new(0, 1 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));

        let err = aspace
            .map_one(&alloc, VirtualAddress::new(0x1001), PhysicalAddress::new(0x1000), PageFlags::KERNEL)
            .unwrap_err();
        assert!(matches!(err, MapError::Unaligned { .. }));

        let err = aspace
            .map_one(&alloc, VirtualAddress::new(0x1000), PhysicalAddress::new(0x1000), PageFlags::KERNEL)
            .unwrap_err();
        assert_eq!(err, MapError::OutOfMemory);
        assert_eq!(aspace.query(VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn unmap_returns_the_frame_once() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));
        let va = VirtualAddress::new(0xD000_0000);

        aspace
            .map_one(&alloc, va, PhysicalAddress::new(0x4000), PageFlags::KERNEL)
            .unwrap();
        assert_eq!(aspace.unmap_one(va), Some(PhysicalAddress::new(0x4000)));
        assert_eq!(aspace.unmap_one(va), None);
        assert_eq!(aspace.query(va), None);
    }

    #[test]
    fn large_directory_leaves_translate_and_refuse_small_maps() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let aspace = AddressSpace::new(&phys, space(&phys, &alloc));
        let dir = unsafe { get_table(&phys, aspace.directory()) };
        dir.set(
            0x300,
            PageEntry::leaf(PhysicalAddress::zero(), PageFlags::KERNEL).with_large_page(true),
        );

        let va = VirtualAddress::new(0xC012_3456);
        assert_eq!(aspace.query(va), Some(PhysicalAddress::new(0x0012_3456)));
        assert_eq!(
            aspace.map_one(&alloc, VirtualAddress::new(0xC000_0000), PhysicalAddress::zero(), PageFlags::KERNEL),
            Err(MapError::LargePage {
                va: VirtualAddress::new(0xC000_0000)
            })
        );
    }

    #[test]
    fn process_directories_share_the_kernel_half() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(0, 16 << 12);
        let kernel = AddressSpace::new(&phys, space(&phys, &alloc));
        kernel
            .map_one(&alloc, VirtualAddress::new(0xC000_0000), PhysicalAddress::new(0x2000), PageFlags::KERNEL)
            .unwrap();

        let process = AddressSpace::new(&phys, space(&phys, &alloc));
        process.copy_kernel_entries(&kernel);
        process
            .map_one(&alloc, VirtualAddress::new(0x0040_0000), PhysicalAddress::new(0x3000), PageFlags::USER)
            .unwrap();

        assert_eq!(
            process.query(VirtualAddress::new(0xC000_0000)),
            Some(PhysicalAddress::new(0x2000))
        );
        assert_eq!(kernel.query(VirtualAddress::new(0x0040_0000)), None);

        assert_eq!(process.free_user_tables(&alloc), 1);
        assert_eq!(alloc.freed.get(), 1);
        assert_eq!(process.query(VirtualAddress::new(0x0040_0000)), None);
        assert!(process.query(VirtualAddress::new(0xC000_0000)).is_some());
    }

    #[test]
    fn map_error_messages() {
        let err = MapError::Unaligned {
            va: VirtualAddress::new(0x1001),
            pa: PhysicalAddress::new(0x2000),
        };
        assert_eq!(err.to_string(), "0x00001001 -> 0x00002000 is not 4 KiB aligned");
    }
}
