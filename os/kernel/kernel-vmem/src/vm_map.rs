//! # Kernel virtual-memory map
//!
//! The kernel address space is partitioned into a handful of regions fixed
//! at boot. *Static* regions are linearly mapped onto physical memory once
//! and never change; dynamic regions are filled on demand through the paging
//! calls. All lookups are linear scans.

use crate::entry::PageFlags;
use crate::info;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Capacity of the region table.
pub const MAX_REGIONS: usize = 8;

/// One slice of the kernel address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub virt: VirtualAddress,
    /// Physical base for static regions; ignored otherwise.
    pub phys: PhysicalAddress,
    pub size: u32,
    pub is_static: bool,
    pub flags: PageFlags,
}

impl Region {
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32().wrapping_sub(self.virt.as_u32()) < self.size
    }

    #[must_use]
    pub const fn contains_phys(&self, pa: PhysicalAddress) -> bool {
        self.is_static && pa.as_u32().wrapping_sub(self.phys.as_u32()) < self.size
    }
}

/// The standard layout: the kernel image window, the kernel heap window,
/// the local APIC, and user space.
pub static STANDARD_REGIONS: [Region; 4] = [
    Region {
        name: "kernel",
        virt: VirtualAddress::new(info::KERNEL_BASE),
        phys: PhysicalAddress::new(info::KERNEL_PHYS_BASE),
        size: info::KERNEL_STATIC_SIZE,
        is_static: true,
        flags: PageFlags::KERNEL,
    },
    Region {
        name: "heap",
        virt: VirtualAddress::new(info::HEAP_BASE),
        phys: PhysicalAddress::zero(),
        size: info::HEAP_SIZE,
        is_static: false,
        flags: PageFlags::KERNEL,
    },
    Region {
        name: "lapic",
        virt: VirtualAddress::new(info::LAPIC_BASE),
        phys: PhysicalAddress::new(info::LAPIC_BASE),
        size: info::LAPIC_SIZE,
        is_static: true,
        flags: PageFlags::DEVICE,
    },
    Region {
        name: "user",
        virt: VirtualAddress::new(info::USER_BASE),
        phys: PhysicalAddress::zero(),
        size: info::USER_END - info::USER_BASE,
        is_static: false,
        flags: PageFlags::USER,
    },
];

/// The region table.
#[derive(Debug, Copy, Clone)]
pub struct VmMap {
    regions: &'static [Region],
}

impl VmMap {
    /// # Panics
    /// If more than [`MAX_REGIONS`] regions are given.
    #[must_use]
    pub const fn new(regions: &'static [Region]) -> Self {
        assert!(regions.len() <= MAX_REGIONS, "too many vm regions");
        Self { regions }
    }

    #[must_use]
    pub const fn standard() -> Self {
        Self::new(&STANDARD_REGIONS)
    }

    #[must_use]
    pub const fn regions(&self) -> &'static [Region] {
        self.regions
    }

    /// The region containing `va`.
    #[must_use]
    pub fn region(&self, va: VirtualAddress) -> Option<&'static Region> {
        self.regions.iter().find(|r| r.contains(va))
    }

    /// Static virtual address of physical address `pa`.
    #[must_use]
    pub fn phys_to_virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.regions
            .iter()
            .find(|r| r.contains_phys(pa))
            .map(|r| r.virt + (pa.as_u32() - r.phys.as_u32()))
    }

    /// Physical address behind a static virtual address.
    #[must_use]
    pub fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.region(va)
            .filter(|r| r.is_static)
            .map(|r| r.phys + (va.as_u32() - r.virt.as_u32()))
    }

    /// Whether `va` lies in a static region.
    #[must_use]
    pub fn is_static(&self, va: VirtualAddress) -> bool {
        self.region(va).is_some_and(|r| r.is_static)
    }

    /// Whether `pa` is covered by a static region.
    #[must_use]
    pub fn is_static_phys(&self, pa: PhysicalAddress) -> bool {
        self.regions.iter().any(|r| r.contains_phys(pa))
    }

    /// Flags of the region owning `va`; no access if none does.
    #[must_use]
    pub fn page_flags(&self, va: VirtualAddress) -> PageFlags {
        self.region(va).map_or(PageFlags::NONE, |r| r.flags)
    }
}

impl Default for VmMap {
    fn default() -> Self {
        Self::standard()
    }
}
