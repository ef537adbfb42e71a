//! # Physical Memory
//!
//! The page allocator behind the paging subsystem and the ways to reach a
//! physical frame from kernel code.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ paging (kernel crate)        │  map / kp_map / create_directory
//! └──────┬───────────────┬───────┘
//!        │ FrameAlloc    │ PhysMapper
//! ┌──────▼────────────┐ ┌▼──────────────────────────┐
//! │ FreeListFrameAlloc│ │ StaticRegionMapper / SimRam│
//! │ (SpinLock'd list) ├─►                           │
//! └───────────────────┘ └───────────────────────────┘
//! ```
//!
//! The allocator's lock is a plain [`SpinLock`](kernel_sync::SpinLock);
//! [`FrameAlloc::lock_held`](kernel_vmem::FrameAlloc::lock_held) reports
//! whether the calling CPU holds it, so the paging code can refuse to run
//! nested inside an allocation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # fn demo<A: kernel_arch::Arch>(cpus: std::sync::Arc<kernel_sync::Cpus<A>>) {
//! use kernel_alloc::frame_alloc::FreeListFrameAlloc;
//! use kernel_alloc::phys_mapper::StaticRegionMapper;
//! use kernel_info::boot::FrameRange;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{FrameAlloc, VmMap};
//!
//! let pool = FrameRange::new(PhysicalAddress::new(0x0100_0000), PhysicalAddress::new(0x0200_0000));
//! let frames = FreeListFrameAlloc::new(cpus, StaticRegionMapper::new(VmMap::standard()), pool)
//!     .expect("page pool");
//! if let Some(frame) = frames.alloc_4k() {
//!     frames.free_4k(frame);
//! }
//! # }
//! ```

#![cfg_attr(not(any(test, doctest, feature = "sim")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;

pub use frame_alloc::{AllocError, FrameBatch, FreeListFrameAlloc};
