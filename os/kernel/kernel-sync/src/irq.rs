//! # Interrupt and preemption discipline
//!
//! `push_no_interrupts`/`pop_no_interrupts` nest per CPU. The outermost push
//! captures the interrupt flag and disables interrupts; the matching
//! outermost pop restores the captured flag. `preempt_disable` and
//! `preempt_enable` keep a second counter on the same descriptor, updated
//! with interrupts disabled.
//!
//! Before the CPUs are enumerated there is no descriptor to count on; the
//! calls then only insist that interrupts are already off.

use crate::cpu::Cpus;
use core::sync::atomic::Ordering;
use kernel_arch::Arch;

impl<A: Arch> Cpus<A> {
    /// Disable interrupts, nesting.
    #[track_caller]
    pub fn push_no_interrupts(&self) {
        let enabled = self.arch().interrupts_enabled();
        // Off before the lookup, so the descriptor is the one we stay on.
        self.arch().disable_interrupts();
        let Some(cpu) = self.local() else {
            if enabled {
                crate::fatal!(self, "push_no_interrupts before enumeration with interrupts enabled");
            }
            return;
        };

        if cpu.irq_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            cpu.set_interrupts_were_enabled(enabled);
        }
    }

    /// Undo one [`push_no_interrupts`](Self::push_no_interrupts). A pop
    /// without a matching push is fatal.
    #[track_caller]
    pub fn pop_no_interrupts(&self) {
        let Some(cpu) = self.local() else {
            if self.arch().interrupts_enabled() {
                crate::fatal!(self, "pop_no_interrupts before enumeration with interrupts enabled");
            }
            return;
        };

        let depth = cpu.irq_depth.load(Ordering::Acquire);
        if depth == 0 {
            crate::fatal!(self, "pop_no_interrupts underflow on cpu{}", cpu.index());
        }
        if self.arch().interrupts_enabled() {
            crate::fatal!(self, "pop_no_interrupts with interrupts enabled on cpu{}", cpu.index());
        }

        cpu.irq_depth.store(depth - 1, Ordering::Release);
        if depth == 1 && cpu.interrupts_were_enabled() {
            self.arch().enable_interrupts();
        }
    }

    /// Forbid rescheduling this CPU, nesting.
    #[track_caller]
    pub fn preempt_disable(&self) {
        self.push_no_interrupts();
        if let Some(cpu) = self.local() {
            cpu.preempt_depth.fetch_add(1, Ordering::AcqRel);
        }
        self.pop_no_interrupts();
    }

    /// Undo one [`preempt_disable`](Self::preempt_disable). Going below zero
    /// is fatal.
    #[track_caller]
    pub fn preempt_enable(&self) {
        self.push_no_interrupts();
        if let Some(cpu) = self.local() {
            let depth = cpu.preempt_depth.load(Ordering::Acquire);
            if depth == 0 {
                crate::fatal!(self, "preempt_enable underflow on cpu{}", cpu.index());
            }
            cpu.preempt_depth.store(depth - 1, Ordering::Release);
        }
        self.pop_no_interrupts();
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Built on the nesting counters, so guards may be stacked freely; only the
/// outermost one re-enables interrupts, and only if they were enabled when it
/// was created.
///
/// ```no_run
/// # fn demo<A: kernel_arch::Arch>(cpus: &kernel_sync::Cpus<A>) {
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(cpus);
///     let cpu = cpus.current();
///     assert!(cpu.irq_depth() >= 1);
/// }
/// # }
/// ```
pub struct IrqGuard<'a, A: Arch> {
    cpus: &'a Cpus<A>,
}

impl<'a, A: Arch> IrqGuard<'a, A> {
    #[inline]
    #[must_use]
    #[track_caller]
    pub fn new(cpus: &'a Cpus<A>) -> Self {
        cpus.push_no_interrupts();
        Self { cpus }
    }
}

impl<A: Arch> Drop for IrqGuard<'_, A> {
    fn drop(&mut self) {
        self.cpus.pop_no_interrupts();
    }
}
