//! # Per-CPU registry
//!
//! One [`CpuDescriptor`] per enumerated core, looked up by local APIC id.
//! The table is filled exactly once from the boot enumeration; until then
//! [`Cpus::current`] is unavailable and the interrupt discipline only checks
//! that interrupts are already off.
//!
//! Descriptor fields are atomics so that other CPUs may read them (e.g. the
//! `active` flag during TLB shootdown), but every field except `active` is
//! only written by the CPU it describes, with interrupts disabled.

use crate::SyncOnceCell;
use alloc::vec::Vec;
use core::fmt;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_arch::{Arch, IpiTarget, PANIC_VECTOR};
use kernel_info::boot::MAX_CPUS;

/// Value of `current_thread` when the CPU runs no thread.
const NO_THREAD: u64 = 0;

/// State of one core.
pub struct CpuDescriptor<A: Arch> {
    index: usize,
    apic_id: u32,
    active: AtomicBool,
    interrupts_were_enabled: AtomicBool,
    pub(crate) irq_depth: AtomicU32,
    pub(crate) preempt_depth: AtomicU32,
    in_interrupt: AtomicBool,
    current_thread: AtomicU64,
    scheduler_thread: AtomicU64,
    scheduler_context: SyncOnceCell<A::Context>,
}

impl<A: Arch> CpuDescriptor<A> {
    fn new(index: usize, apic_id: u32) -> Self {
        Self {
            index,
            apic_id,
            active: AtomicBool::new(false),
            interrupts_were_enabled: AtomicBool::new(false),
            irq_depth: AtomicU32::new(0),
            preempt_depth: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
            current_thread: AtomicU64::new(NO_THREAD),
            scheduler_thread: AtomicU64::new(NO_THREAD),
            scheduler_context: SyncOnceCell::new(),
        }
    }

    /// Position in the enumeration order.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn apic_id(&self) -> u32 {
        self.apic_id
    }

    /// Whether the CPU has entered service and takes part in TLB shootdowns
    /// and checkpoints.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Nesting depth of [`Cpus::push_no_interrupts`].
    #[must_use]
    pub fn irq_depth(&self) -> u32 {
        self.irq_depth.load(Ordering::Acquire)
    }

    /// Nesting depth of [`Cpus::preempt_disable`].
    #[must_use]
    pub fn preempt_depth(&self) -> u32 {
        self.preempt_depth.load(Ordering::Acquire)
    }

    /// The interrupt flag captured by the outermost `push_no_interrupts`.
    #[must_use]
    pub fn interrupts_were_enabled(&self) -> bool {
        self.interrupts_were_enabled.load(Ordering::Acquire)
    }

    /// Overwrite the captured interrupt flag. Used when a context switch
    /// moves a thread's flag onto this CPU.
    pub fn set_interrupts_were_enabled(&self, enabled: bool) {
        self.interrupts_were_enabled.store(enabled, Ordering::Release);
    }

    /// Whether this CPU is servicing a hardware interrupt.
    #[must_use]
    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::Acquire)
    }

    pub fn set_in_interrupt(&self, value: bool) {
        self.in_interrupt.store(value, Ordering::Release);
    }

    /// Id of the thread running on this CPU, if any.
    #[must_use]
    pub fn current_thread(&self) -> Option<u64> {
        match self.current_thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    pub fn set_current_thread(&self, tid: Option<u64>) {
        self.current_thread
            .store(tid.unwrap_or(NO_THREAD), Ordering::Release);
    }

    /// Id of this CPU's scheduler thread, once created.
    #[must_use]
    pub fn scheduler_thread(&self) -> Option<u64> {
        match self.scheduler_thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    pub fn set_scheduler_thread(&self, tid: u64) {
        self.scheduler_thread.store(tid, Ordering::Release);
    }

    /// The saved context of this CPU's scheduler loop, created on first use.
    pub fn scheduler_context(&self, create: impl FnOnce() -> A::Context) -> &A::Context {
        self.scheduler_context.get_or_init(create)
    }
}

/// The CPU topology plus the processor it runs on.
pub struct Cpus<A: Arch> {
    arch: A,
    cpus: SyncOnceCell<Vec<CpuDescriptor<A>>>,
    /// `apic_id + 1` of the CPU printing a fatal diagnostic, 0 if none.
    panic_owner: AtomicU32,
}

impl<A: Arch> Cpus<A> {
    /// An empty registry. Call [`enumerate`](Self::enumerate) before
    /// entering multiprocessor operation.
    pub const fn new(arch: A) -> Self {
        Self {
            arch,
            cpus: SyncOnceCell::new(),
            panic_owner: AtomicU32::new(0),
        }
    }

    pub const fn arch(&self) -> &A {
        &self.arch
    }

    /// Register the boot-enumerated cores, in order.
    ///
    /// Registering twice, more than [`MAX_CPUS`] cores, or the same APIC id
    /// twice is fatal.
    #[track_caller]
    pub fn enumerate(&self, apic_ids: &[u32]) {
        if apic_ids.len() > MAX_CPUS {
            crate::fatal!(
                self,
                "{} cpus enumerated, the table holds {MAX_CPUS}",
                apic_ids.len()
            );
        }
        for (i, id) in apic_ids.iter().enumerate() {
            if apic_ids[..i].contains(id) {
                crate::fatal!(self, "apic id {id} enumerated twice");
            }
        }

        let table = apic_ids
            .iter()
            .enumerate()
            .map(|(index, &apic_id)| CpuDescriptor::new(index, apic_id))
            .collect();
        if self.cpus.set(table).is_err() {
            crate::fatal!(self, "cpus enumerated twice");
        }
        log::info!("{} cpus enumerated: {apic_ids:?}", apic_ids.len());
    }

    #[must_use]
    pub fn is_enumerated(&self) -> bool {
        self.cpus.get().is_some()
    }

    /// All registered CPUs in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &CpuDescriptor<A>> {
        self.cpus.get().map_or(&[][..], Vec::as_slice).iter()
    }

    #[must_use]
    pub fn by_apic_id(&self, apic_id: u32) -> Option<&CpuDescriptor<A>> {
        self.iter().find(|cpu| cpu.apic_id == apic_id)
    }

    #[must_use]
    pub fn by_index(&self, index: usize) -> Option<&CpuDescriptor<A>> {
        self.cpus.get()?.get(index)
    }

    /// The CPU executing this call.
    ///
    /// Must be called with interrupts disabled, after enumeration, on a
    /// registered core; anything else is fatal.
    #[track_caller]
    pub fn current(&self) -> &CpuDescriptor<A> {
        if self.arch.interrupts_enabled() {
            crate::fatal!(self, "current cpu lookup with interrupts enabled");
        }
        match self.local() {
            Some(cpu) => cpu,
            None => crate::fatal!(self, "current cpu lookup before enumeration"),
        }
    }

    /// The CPU executing this call, without the interrupt-flag check.
    /// Only meaningful for diagnostics: the caller may migrate.
    #[must_use]
    pub fn try_current(&self) -> Option<&CpuDescriptor<A>> {
        self.by_apic_id(self.arch.local_apic_id())
    }

    /// `None` before enumeration; an enumerated table without this core is
    /// fatal.
    #[track_caller]
    pub(crate) fn local(&self) -> Option<&CpuDescriptor<A>> {
        let table = self.cpus.get()?;
        let apic_id = self.arch.local_apic_id();
        match table.iter().find(|cpu| cpu.apic_id == apic_id) {
            Some(cpu) => Some(cpu),
            None => crate::fatal!(self, "apic id {apic_id} is not a registered cpu"),
        }
    }

    /// Mark `cpu` as in service.
    pub fn activate(&self, cpu: &CpuDescriptor<A>) {
        cpu.active.store(true, Ordering::Release);
        log::info!("cpu{} (apic {}) active", cpu.index, cpu.apic_id);
    }

    /// Number of CPUs that have entered service.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.iter().filter(|cpu| cpu.is_active()).count()
    }

    /// Halt the machine with a diagnostic.
    ///
    /// Logs the message with the caller's location, tells the other CPUs to
    /// stop, and halts this one. A nested fault on the same CPU re-enters
    /// instead of deadlocking on the panic lock.
    #[track_caller]
    #[cold]
    pub fn fatal(&self, args: fmt::Arguments<'_>) -> ! {
        let location = Location::caller();
        self.arch.disable_interrupts();

        let me = self.arch.local_apic_id().wrapping_add(1);
        loop {
            match self
                .panic_owner
                .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
            {
                Err(owner) if owner != me => self.arch.relax(),
                _ => break,
            }
        }

        match self.try_current() {
            Some(cpu) => log::error!("cpu{} panicked at {location}: {args}", cpu.index),
            None => log::error!("panicked at {location}: {args}"),
        }
        if self.is_enumerated() {
            self.arch.send_ipi(IpiTarget::AllExcludingSelf, PANIC_VECTOR);
            // Halting before the APIC accepted the ICR would drop the IPI.
            self.arch.wait_for_ipi_delivery();
        }
        self.arch.halt(format_args!("{args} ({location})"))
    }
}

/// Halt the machine through [`Cpus::fatal`] with a formatted message.
#[macro_export]
macro_rules! fatal {
    ($cpus:expr, $($arg:tt)*) => {
        $cpus.fatal(::core::format_args!($($arg)*))
    };
}

impl<A: Arch> fmt::Debug for CpuDescriptor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuDescriptor")
            .field("index", &self.index)
            .field("apic_id", &self.apic_id)
            .field("active", &self.is_active())
            .field("irq_depth", &self.irq_depth())
            .field("preempt_depth", &self.preempt_depth())
            .field("current_thread", &self.current_thread())
            .finish_non_exhaustive()
    }
}
