//! # Kernel synchronization primitives
//!
//! The per-CPU registry and everything layered on it:
//!
//! * [`Cpus`]: descriptors by APIC id, the "current CPU" lookup and the
//!   fatal-halt path ([`fatal!`]).
//! * The interrupt/preemption discipline on [`Cpus`]
//!   (`push_no_interrupts`, `preempt_disable`, …) and its RAII form
//!   [`IrqGuard`].
//! * [`SpinLock`]: CPU-owned lock with optional recursion and explicit
//!   ownership handoff between control flows.
//! * [`Checkpoint`]: rendezvous of the active CPUs.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod checkpoint;
pub mod cpu;
pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use checkpoint::Checkpoint;
pub use cpu::{CpuDescriptor, Cpus};
pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard, SpinLockRecursiveGuard};
pub use sync_once_cell::SyncOnceCell;
