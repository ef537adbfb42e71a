//! Physical page allocator.
//!
//! Free frames form a singly linked list threaded through the frames
//! themselves: the first word of each free frame holds the physical address
//! of the next one. The list head sits behind a [`SpinLock`], whose
//! ownership answers [`FrameAlloc::lock_held`].

use alloc::sync::Arc;
use kernel_arch::Arch;
use kernel_info::boot::FrameRange;
use kernel_memory_addresses::{PhysicalAddress, Size4K};
use kernel_sync::{Cpus, SpinLock, fatal};
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Marks the end of the free list.
const END: u32 = u32::MAX;
const FRAME_SIZE: u32 = 4096;

#[repr(C)]
struct FreeFrame {
    next: u32,
}

struct FreeList {
    head: u32,
    free: usize,
}

impl FreeList {
    fn pop<M: PhysMapper>(&mut self, mapper: &M) -> Option<PhysicalAddress> {
        if self.head == END {
            log::warn!("frame allocator exhausted");
            return None;
        }
        let frame = PhysicalAddress::new(self.head);
        self.head = unsafe { mapper.phys_to_mut::<FreeFrame>(frame).next };
        self.free -= 1;
        Some(frame)
    }

    fn push<M: PhysMapper>(&mut self, mapper: &M, frame: PhysicalAddress) {
        unsafe {
            mapper.phys_to_mut::<FreeFrame>(frame).next = self.head;
        }
        self.head = frame.as_u32();
        self.free += 1;
    }
}

/// Why an allocator could not be built.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("frame range {start}..{end} is not page aligned")]
    Unaligned {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
    #[error("frame range {start}..{end} holds no frames")]
    Empty {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
}

/// Free-list allocator over one contiguous physical range.
pub struct FreeListFrameAlloc<A: Arch, M: PhysMapper> {
    cpus: Arc<Cpus<A>>,
    mapper: M,
    range: FrameRange,
    list: SpinLock<FreeList>,
}

impl<A: Arch, M: PhysMapper> FreeListFrameAlloc<A, M> {
    /// Put every frame of `range` on the free list, lowest address first.
    /// `mapper` must reach the whole range.
    ///
    /// # Errors
    /// If the range is misaligned or empty.
    pub fn new(cpus: Arc<Cpus<A>>, mapper: M, range: FrameRange) -> Result<Self, AllocError> {
        let (start, end) = (range.start, range.end);
        if !start.is_aligned::<Size4K>() || !end.is_aligned::<Size4K>() {
            return Err(AllocError::Unaligned { start, end });
        }
        let total = range.frame_count();
        if total == 0 {
            return Err(AllocError::Empty { start, end });
        }

        let mut head = END;
        for n in (0..total).rev() {
            let frame = start.as_u32() + (n as u32) * FRAME_SIZE;
            unsafe {
                mapper
                    .phys_to_mut::<FreeFrame>(PhysicalAddress::new(frame))
                    .next = head;
            }
            head = frame;
        }
        log::info!("frame allocator: {total} frames at {start}..{end}");

        Ok(Self {
            cpus,
            mapper,
            range,
            list: SpinLock::new("frames", FreeList { head, free: total }),
        })
    }

    /// The mapper used to reach the frames.
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    pub const fn range(&self) -> FrameRange {
        self.range
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.list.lock(&self.cpus).free
    }

    /// Run `f` with the allocator locked once for all of its allocations.
    pub fn batch<R>(&self, f: impl FnOnce(&mut FrameBatch<'_, A, M>) -> R) -> R {
        let mut list = self.list.lock(&self.cpus);
        f(&mut FrameBatch {
            alloc: self,
            list: &mut *list,
        })
    }

    fn owns(&self, frame: PhysicalAddress) -> bool {
        frame.is_aligned::<Size4K>()
            && frame.as_u32() >= self.range.start.as_u32()
            && frame.as_u32() < self.range.end.as_u32()
    }
}

impl<A: Arch, M: PhysMapper> FrameAlloc for FreeListFrameAlloc<A, M> {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.list.lock(&self.cpus).pop(&self.mapper)
    }

    fn free_4k(&self, frame: PhysicalAddress) {
        if !self.owns(frame) {
            fatal!(self.cpus, "freeing {frame}, which the frame allocator does not own");
        }
        self.list.lock(&self.cpus).push(&self.mapper, frame);
    }

    fn lock_held(&self) -> bool {
        self.list.held(&self.cpus)
    }
}

/// Allocations and releases made under one hold of the allocator lock.
///
/// The paging entry points refuse to run inside a batch.
pub struct FrameBatch<'a, A: Arch, M: PhysMapper> {
    alloc: &'a FreeListFrameAlloc<A, M>,
    list: &'a mut FreeList,
}

impl<A: Arch, M: PhysMapper> FrameBatch<'_, A, M> {
    pub fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.list.pop(&self.alloc.mapper)
    }

    pub fn free_4k(&mut self, frame: PhysicalAddress) {
        if !self.alloc.owns(frame) {
            fatal!(self.alloc.cpus, "freeing {frame}, which the frame allocator does not own");
        }
        self.list.push(&self.alloc.mapper, frame);
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.list.free
    }
}
