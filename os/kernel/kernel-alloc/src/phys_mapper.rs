//! # Reaching physical memory
//!
//! [`StaticRegionMapper`] goes through the kernel's static windows (see
//! [`VmMap`]); it is what the kernel uses on hardware, where the whole
//! page pool lies inside the static kernel window.
//!
//! [`SimRam`] (feature `sim`) is a heap-backed stand-in for physical memory,
//! used by the host test suites.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{PhysMapper, VmMap};

/// [`PhysMapper`] through the static regions of a [`VmMap`].
#[derive(Debug, Copy, Clone)]
pub struct StaticRegionMapper {
    map: VmMap,
}

impl StaticRegionMapper {
    #[must_use]
    pub const fn new(map: VmMap) -> Self {
        Self { map }
    }
}

impl PhysMapper for StaticRegionMapper {
    /// # Panics
    /// If `pa` is outside every static region.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(va) = self.map.phys_to_virt(pa) else {
            panic!("physical address {pa} is outside the static kernel window");
        };
        // SAFETY: static regions are mapped writable in every address space.
        unsafe { &mut *(va.as_usize() as *mut T) }
    }
}

#[cfg(feature = "sim")]
pub use sim::SimRam;

#[cfg(feature = "sim")]
mod sim {
    use core::cell::UnsafeCell;
    use kernel_info::boot::FrameRange;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::PhysMapper;

    #[repr(C, align(4096))]
    struct Frame(UnsafeCell<[u8; 4096]>);

    /// Physical memory for host tests: `frames` pages starting at `base`.
    pub struct SimRam {
        base: PhysicalAddress,
        frames: Box<[Frame]>,
    }

    // Callers coordinate access the same way they would for real RAM.
    unsafe impl Sync for SimRam {}

    impl SimRam {
        /// # Panics
        /// If `base` is not page aligned.
        #[must_use]
        pub fn new(base: PhysicalAddress, frames: usize) -> Self {
            assert_eq!(base.as_u32() & 0xFFF, 0, "sim ram must start on a page");
            Self {
                base,
                frames: (0..frames)
                    .map(|_| Frame(UnsafeCell::new([0; 4096])))
                    .collect(),
            }
        }

        /// The whole RAM as a frame range.
        #[must_use]
        pub fn range(&self) -> FrameRange {
            let size = u32::try_from(self.frames.len() * 4096).unwrap_or(u32::MAX);
            FrameRange::new(self.base, self.base + size)
        }
    }

    impl PhysMapper for SimRam {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let offset = pa.as_u32().wrapping_sub(self.base.as_u32()) as usize;
            let frame = &self.frames[offset / 4096];
            // SAFETY: the frame outlives `'a` as long as the RAM does; the
            // caller picks `T` to match.
            unsafe { &mut *frame.0.get().cast::<u8>().add(offset % 4096).cast::<T>() }
        }
    }
}
