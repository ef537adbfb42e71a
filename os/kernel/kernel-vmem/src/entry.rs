//! # Page-directory and page-table entries
//!
//! 32-bit paging uses one entry format for both levels:
//!
//! ```text
//! 31            12 11  9  8   7   6   5   4   3   2   1   0
//! ┌───────────────┬─────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//! │  frame >> 12  │avail│ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//! └───────────────┴─────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! A directory entry either points at a page table (`PS=0`) or maps a
//! 4 MiB page (`PS=1`). Entries with `P=0` carry no meaningful address.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// One 32-bit paging entry (PDE or PTE).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Bit 0: the entry is valid.
    pub present: bool,
    /// Bit 1: writes allowed.
    pub writable: bool,
    /// Bit 2: accessible from ring 3.
    pub user: bool,
    /// Bit 3: write-through caching.
    pub write_through: bool,
    /// Bit 4: caching disabled.
    pub cache_disabled: bool,
    /// Bit 5: set by the CPU on access.
    pub accessed: bool,
    /// Bit 6: set by the CPU on write (leaves only).
    pub dirty: bool,
    /// Bit 7: 4 MiB page (directory entries only).
    pub large_page: bool,
    /// Bit 8: survives CR3 reloads.
    pub global: bool,
    /// Bits 9–11: ignored by the CPU.
    #[bits(3)]
    pub available: u8,
    /// Bits 12–31: physical frame number.
    #[bits(20)]
    pub frame: u32,
}

/// Permission and caching bits of a mapping, as kept by the region table
/// and passed to the paging calls.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub global: bool,
    #[bits(3)]
    __: u8,
}

impl PageFlags {
    /// No access at all.
    pub const NONE: Self = Self::new();
    /// Kernel read/write, shared by every address space.
    pub const KERNEL: Self = Self::new().with_writable(true).with_global(true);
    /// Kernel read/write, uncached (MMIO).
    pub const DEVICE: Self = Self::KERNEL.with_cache_disabled(true);
    /// User read/write.
    pub const USER: Self = Self::new().with_writable(true).with_user(true);
}

impl PageEntry {
    /// A leaf mapping `pa` with `flags`. Always present.
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, flags: PageFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable())
            .with_user(flags.user())
            .with_write_through(flags.write_through())
            .with_cache_disabled(flags.cache_disabled())
            .with_global(flags.global())
            .with_frame(pa.as_u32() >> 12)
    }

    /// A directory entry pointing at the page table in frame `pa`.
    ///
    /// Directory entries are writable; the leaves decide. `user` must be set
    /// if any leaf below is a user mapping.
    #[must_use]
    pub const fn table(pa: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(pa.as_u32() >> 12)
    }

    /// The frame this entry refers to, if present.
    #[must_use]
    pub const fn address(self) -> Option<PhysicalAddress> {
        if self.present() {
            Some(PhysicalAddress::new(self.frame() << 12))
        } else {
            None
        }
    }

    /// The frame as a typed page, if present.
    #[must_use]
    pub const fn page(self) -> Option<PhysicalPage<Size4K>> {
        if self.present() {
            Some(PhysicalPage::from_number(self.frame()))
        } else {
            None
        }
    }

    /// Permission bits of this entry.
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::new()
            .with_writable(self.writable())
            .with_user(self.user())
            .with_write_through(self.write_through())
            .with_cache_disabled(self.cache_disabled())
            .with_global(self.global())
    }
}
