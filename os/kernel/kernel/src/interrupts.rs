//! # Interrupt dispatch
//!
//! A fixed table of [`ISR_VECTORS`] handlers indexed by vector. Handlers are
//! installed with [`Kernel::set_handler`] during bring-up; once the kernel is
//! marked initialized the table is sealed and changing it is fatal.
//!
//! The architecture's entry stubs call [`Kernel::handle_interrupt`] (through
//! [`InterruptSink`]) with interrupts disabled. Dispatch flags the CPU as
//! servicing an interrupt, runs the handler and acknowledges the local APIC,
//! except for the spurious vector.
//!
//! | Vector                  | Handler                                   |
//! |-------------------------|-------------------------------------------|
//! | `TIMER_VECTOR`          | [`timer`]: count a tick                   |
//! | `TLB_SHOOTDOWN_VECTOR`  | apply the pending TLB invalidation, ack   |
//! | `PANIC_VECTOR`          | [`panic`]: halt this CPU                  |
//! | `SPURIOUS_VECTOR`       | [`spurious`]: nothing, no EOI             |

pub mod panic;
pub mod spurious;
pub mod timer;

use crate::{Kernel, vmem};
use kernel_arch::{
    Arch, InterruptSink, PANIC_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR, TLB_SHOOTDOWN_VECTOR,
};
use kernel_sync::{IrqGuard, fatal};
use kernel_vmem::PhysMapper;

/// Size of the handler table; one slot per vector.
pub const ISR_VECTORS: usize = 256;

/// An interrupt handler. Runs with interrupts disabled.
pub type Isr<A, M> = fn(&Kernel<A, M>, u8);

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> Kernel<A, M> {
    /// Install `handler` for `vector`. Fatal once the kernel is initialized.
    #[track_caller]
    pub fn set_handler(&self, vector: u8, handler: Isr<A, M>) {
        if self.is_initialized() {
            fatal!(
                self.cpus,
                "handler for vector {vector:#04x} set after initialization"
            );
        }
        self.isrs.lock(&self.cpus)[usize::from(vector)] = Some(handler);
    }

    /// The handler installed for `vector`.
    #[must_use]
    pub fn handler(&self, vector: u8) -> Option<Isr<A, M>> {
        self.isrs.lock(&self.cpus)[usize::from(vector)]
    }

    /// Install the timer, TLB shootdown, panic and spurious handlers.
    pub fn register_default_handlers(&self) {
        self.set_handler(TIMER_VECTOR, timer::tick);
        self.set_handler(TLB_SHOOTDOWN_VECTOR, vmem::shootdown_handler);
        self.set_handler(PANIC_VECTOR, panic::halt);
        self.set_handler(SPURIOUS_VECTOR, spurious::ignore);
    }

    /// Whether this CPU is servicing an interrupt.
    #[must_use]
    pub fn in_interrupt(&self) -> bool {
        let _irq = IrqGuard::new(&self.cpus);
        self.cpus.current().in_interrupt()
    }

    /// Run the handler for `vector`. Interrupts must be disabled.
    ///
    /// A vector without a handler is fatal.
    pub fn handle_interrupt(&self, vector: u8) {
        let cpu = self.cpus.current();
        let nested = cpu.in_interrupt();
        cpu.set_in_interrupt(true);

        let Some(handler) = self.handler(vector) else {
            fatal!(self.cpus, "no handler for vector {vector:#04x}");
        };
        handler(self, vector);

        cpu.set_in_interrupt(nested);
        if vector != SPURIOUS_VECTOR {
            self.arch().end_of_interrupt();
        }
    }
}

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> InterruptSink for Kernel<A, M> {
    fn dispatch(&self, vector: u8) {
        self.handle_interrupt(vector);
    }
}
