//! # Kernel Boot Information

use kernel_memory_addresses::PhysicalAddress;

/// Capacity of the CPU table. Boot enumeration beyond this is fatal.
pub const MAX_CPUS: usize = 8;

/// Information the kernel needs from the boot trampolines.
/// Keep this `#[repr(C)]`; the trampolines fill it before entering Rust.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct BootInfo {
    /// Number of valid entries in `apic_ids`.
    pub cpu_count: u32,

    /// Local APIC ids in enumeration order. Entry 0 is the bootstrap processor.
    pub apic_ids: [u32; MAX_CPUS],

    /// Physical pages handed to the page allocator.
    pub frames: FrameRange,
}

/// Half-open physical range `[start, end)` of page frames.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl FrameRange {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// Number of whole 4 KiB frames in the range.
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        if self.end.as_u32() <= self.start.as_u32() {
            return 0;
        }
        ((self.end.as_u32() - self.start.as_u32()) >> 12) as usize
    }
}

impl BootInfo {
    /// Build the hand-off record. Returns `None` if more CPUs were enumerated
    /// than the table can hold.
    #[must_use]
    pub fn new(apic_ids: &[u32], frames: FrameRange) -> Option<Self> {
        if apic_ids.len() > MAX_CPUS {
            return None;
        }
        let mut ids = [0; MAX_CPUS];
        ids[..apic_ids.len()].copy_from_slice(apic_ids);
        Some(Self {
            cpu_count: u32::try_from(apic_ids.len()).ok()?,
            apic_ids: ids,
            frames,
        })
    }

    /// The enumerated APIC ids, in order.
    #[must_use]
    pub fn cpus(&self) -> &[u32] {
        let n = (self.cpu_count as usize).min(MAX_CPUS);
        &self.apic_ids[..n]
    }
}
