//! # Processor Primitives
//!
//! Everything the kernel core needs from the processor, expressed as one
//! [`Arch`] trait: the interrupt flag, the local APIC, the paging registers,
//! and saved execution contexts.
//!
//! Two implementations exist:
//!
//! * [`x86::X86`] drives real 32-bit x86 hardware (only compiled for
//!   `target_arch = "x86"`).
//! * [`sim::Sim`] (feature `sim`) models a multi-core machine on the host.
//!   Each simulated CPU is an OS thread; interrupts are delivered whenever the
//!   running code enables interrupts, relaxes in a spin loop, or idles.
//!
//! ```text
//!  kernel-sync ─┐
//!  kernel-alloc ├──► Arch ──┬──► X86 (cli/sti, LAPIC MMIO, CR3, invlpg)
//!  kernel ──────┘           └──► Sim (host threads, per-CPU interrupt queues)
//! ```

#![cfg_attr(not(any(test, doctest, feature = "sim")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

use alloc::boxed::Box;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

#[cfg(feature = "sim")]
pub mod sim;

#[cfg(target_arch = "x86")]
pub mod x86;

/// Periodic timer tick.
pub const TIMER_VECTOR: u8 = 0xE0;

/// Remote TLB invalidation request.
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xF1;

/// Another CPU has panicked; stop executing.
pub const PANIC_VECTOR: u8 = 0xF2;

/// Spurious local APIC interrupt. Never acknowledged.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Receiver of hardware interrupts. Installed once via
/// [`Arch::attach_interrupt_sink`]; the entry stubs call
/// [`dispatch`](InterruptSink::dispatch) with interrupts disabled.
pub trait InterruptSink: Sync {
    fn dispatch(&self, vector: u8);
}

/// Destination of an inter-processor interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpiTarget {
    /// The CPU with this local APIC id.
    Apic(u32),
    /// Every CPU except the sender.
    AllExcludingSelf,
    /// Every CPU including the sender.
    All,
}

/// Access to the executing processor.
///
/// All methods act on the CPU that calls them.
pub trait Arch: Send + Sync + 'static {
    /// Saved execution state of one thread of control.
    type Context: Send + Sync;

    /// Whether the interrupt flag is set.
    fn interrupts_enabled(&self) -> bool;

    /// Clear the interrupt flag.
    fn disable_interrupts(&self);

    /// Set the interrupt flag. Pending interrupts may be taken immediately.
    fn enable_interrupts(&self);

    /// Pause inside a spin loop.
    fn relax(&self);

    /// Idle until the next interrupt arrives.
    fn wait_for_interrupt(&self);

    /// The local APIC id of this CPU.
    fn local_apic_id(&self) -> u32;

    /// Send a fixed IPI.
    fn send_ipi(&self, target: IpiTarget, vector: u8);

    /// Spin until the local APIC has accepted the last IPI.
    fn wait_for_ipi_delivery(&self);

    /// Acknowledge the interrupt being serviced.
    fn end_of_interrupt(&self);

    /// Physical address of the active page directory.
    fn active_page_directory(&self) -> PhysicalAddress;

    /// Activate a page directory. Flushes non-global TLB entries.
    fn load_page_directory(&self, directory: PhysicalAddress);

    /// Drop the TLB entry for one page.
    fn invalidate_page(&self, page: VirtualAddress);

    /// Drop every non-global TLB entry.
    fn flush_tlb(&self);

    /// Create a context that runs `entry` the first time it is switched to.
    /// `entry` must never return.
    fn new_context(&self, entry: Box<dyn FnOnce() + Send>) -> Self::Context;

    /// An empty context, filled by the first [`switch_context`](Arch::switch_context)
    /// away from it. Used for the per-CPU scheduler loops.
    fn bootstrap_context(&self) -> Self::Context;

    /// Save the running state into `from` and resume `to`. Returns when some
    /// CPU later switches back to `from`.
    ///
    /// # Safety
    /// Interrupts must be disabled. `to` must be a context that is not running
    /// on any CPU, and `from` must describe the caller.
    unsafe fn switch_context(&self, from: &Self::Context, to: &Self::Context);

    /// Stop this CPU for good.
    fn halt(&self, reason: fmt::Arguments<'_>) -> !;

    /// Route interrupts to `sink`. Only the first call has an effect.
    fn attach_interrupt_sink(&self, sink: &'static dyn InterruptSink);
}
