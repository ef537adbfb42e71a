//! # Memory Layout

/// Lowest user-space address; the first 4 MiB stay unmapped to catch null derefs.
pub const USER_BASE: u32 = 0x0040_0000;

/// End of the user-space VA range after which kernel space begins.
pub const USER_END: u32 = KERNEL_BASE;

/// Where the kernel executes (VMA). The static kernel map starts here and
/// is backed by physical memory starting at [`KERNEL_PHYS_BASE`].
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Physical base of the static kernel map.
pub const KERNEL_PHYS_BASE: u32 = 0;

/// Size of the statically mapped kernel window.
pub const KERNEL_STATIC_SIZE: u32 = 64 * 1024 * 1024;

/// Start of the kernel's dynamically mapped window.
pub const HEAP_BASE: u32 = 0xD000_0000;

/// Size of the kernel's dynamically mapped window.
pub const HEAP_SIZE: u32 = 256 * 1024 * 1024;

/// Default local APIC MMIO base (identity mapped).
pub const LAPIC_BASE: u32 = 0xFEE0_0000;

/// Size of the local APIC MMIO window.
pub const LAPIC_SIZE: u32 = 0x1000;

/// Number of page-directory entries that belong to user space.
pub const USER_DIRECTORY_ENTRIES: usize = (KERNEL_BASE >> 22) as usize;

/// The size of a kernel thread stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(USER_BASE < USER_END);
    assert!(KERNEL_BASE.is_multiple_of(4 * 1024 * 1024));
    assert!(KERNEL_BASE + KERNEL_STATIC_SIZE <= HEAP_BASE);
    assert!(HEAP_BASE + HEAP_SIZE <= LAPIC_BASE);
    assert!(USER_DIRECTORY_ENTRIES == 768);
};
