//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot hand-off structure shared by the
//! boot trampolines and the kernel core.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit, two-level paging):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │   unmapped (null guard)         │
//! USER_BASE   ├─────────────────────────────────┤ 0x0040_0000
//!             │         User Space              │
//! KERNEL_BASE ├─────────────────────────────────┤ 0xC000_0000
//!             │  Kernel static map (phys 0..)   │
//! HEAP_BASE   ├─────────────────────────────────┤ 0xD000_0000
//!             │  Kernel dynamic mappings        │
//! LAPIC_BASE  ├─────────────────────────────────┤ 0xFEE0_0000
//!             │  Local APIC (identity mapped)   │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Every directory shares the kernel half: directory entries at and above
//! [`memory::KERNEL_BASE`] point at the same page tables in every address
//! space.
//!
//! ## Boot Protocol
//!
//! The boot trampolines enumerate the processors and hand the kernel a
//! [`BootInfo`](boot::BootInfo) with the ordered list of APIC ids and the
//! physical page pool. The kernel core never discovers CPUs itself.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
