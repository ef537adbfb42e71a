//! Host-side model of a small SMP machine.
//!
//! Each simulated CPU keeps a register file ([`Eflags`], [`Cr3`]), a queue of
//! pending interrupt vectors, and a log of TLB maintenance. Code runs on a
//! simulated CPU when its OS thread is *attached* to that CPU's slot.
//!
//! Contexts are OS threads handing a baton to each other: switching from `a`
//! to `b` wakes `b`'s thread on the same slot and parks `a`'s thread until
//! someone switches back to it. At most one thread is attached to a slot at
//! any time.
//!
//! Interrupts are only taken at well-defined points: when the interrupt flag
//! is set, inside [`relax`](Arch::relax), and inside
//! [`wait_for_interrupt`](Arch::wait_for_interrupt). Delivery clears the
//! flag, calls the attached [`InterruptSink`], and sets it again, the way an
//! interrupt gate and `iret` would.
//!
//! [`halt`](Arch::halt) stops the whole machine: the halting thread panics
//! with the reason, and every other simulated thread unwinds quietly the next
//! time it touches the machine.

use crate::{Arch, InterruptSink, IpiTarget};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::eflags::Eflags;
use kernel_registers::lapic::{DestinationShorthand, IcrHigh, IcrLow};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

const BATON_POLL: Duration = Duration::from_millis(5);
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// TLB maintenance performed by a simulated CPU, in program order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlbEvent {
    LoadDirectory(PhysicalAddress),
    InvalidatePage(VirtualAddress),
    FlushAll,
}

/// Unwind payload for threads stopped by a machine halt.
struct Halted;

/// Unwind payload for a context dropped while parked.
struct Destroyed;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

fn is_quiet(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Halted>() || payload.is::<Destroyed>()
}

fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct SimCpu {
    apic_id: u32,
    eflags: AtomicU32,
    cr3: AtomicU32,
    pending: Mutex<VecDeque<u8>>,
    tlb: Mutex<Vec<TlbEvent>>,
    eoi: AtomicU64,
}

impl SimCpu {
    fn new(apic_id: u32) -> Self {
        Self {
            apic_id,
            eflags: AtomicU32::new(Eflags::new().into_bits()),
            cr3: AtomicU32::new(Cr3::new().into_bits()),
            pending: Mutex::new(VecDeque::new()),
            tlb: Mutex::new(Vec::new()),
            eoi: AtomicU64::new(0),
        }
    }

    fn interrupts_enabled(&self) -> bool {
        Eflags::from_bits(self.eflags.load(Ordering::Acquire)).if_interrupt_enable()
    }

    fn set_interrupts(&self, enabled: bool) {
        let flags = Eflags::from_bits(self.eflags.load(Ordering::Acquire))
            .with_if_interrupt_enable(enabled);
        self.eflags.store(flags.into_bits(), Ordering::Release);
    }
}

/// Shared state of one simulated machine.
pub struct SimMachine {
    cpus: Vec<SimCpu>,
    halted: AtomicBool,
    fault: Mutex<Option<String>>,
    sink: OnceLock<&'static dyn InterruptSink>,
}

impl SimMachine {
    fn halt_with(&self, reason: String) {
        let mut fault = lock(&self.fault);
        if fault.is_none() {
            *fault = Some(reason);
        }
        self.halted.store(true, Ordering::Release);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BatonState {
    Parked,
    Run(usize),
    Destroyed,
}

struct Baton {
    state: Mutex<BatonState>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            state: Mutex::new(BatonState::Parked),
            cv: Condvar::new(),
        }
    }

    fn pass(&self, slot: usize) {
        *lock(&self.state) = BatonState::Run(slot);
        self.cv.notify_all();
    }

    fn destroy(&self) {
        *lock(&self.state) = BatonState::Destroyed;
        self.cv.notify_all();
    }

    /// Block until this context is resumed; returns the slot to run on.
    fn wait(&self, machine: &SimMachine) -> usize {
        let mut state = lock(&self.state);
        loop {
            match *state {
                BatonState::Run(slot) => {
                    *state = BatonState::Parked;
                    return slot;
                }
                BatonState::Destroyed => {
                    drop(state);
                    panic::resume_unwind(Box::new(Destroyed));
                }
                BatonState::Parked => {
                    if machine.halted.load(Ordering::Acquire) {
                        drop(state);
                        park_forever();
                    }
                    state = self
                        .cv
                        .wait_timeout(state, BATON_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// A simulated execution context.
pub struct SimContext {
    baton: Arc<Baton>,
}

impl Drop for SimContext {
    fn drop(&mut self) {
        self.baton.destroy();
    }
}

/// Handle to a simulated machine. Cheap to clone; all clones drive the same
/// CPUs.
#[derive(Clone)]
pub struct Sim {
    machine: Arc<SimMachine>,
}

impl Sim {
    /// A machine with one CPU per APIC id, all with interrupts disabled and
    /// an empty CR3.
    #[must_use]
    pub fn new(apic_ids: &[u32]) -> Self {
        Self {
            machine: Arc::new(SimMachine {
                cpus: apic_ids.iter().copied().map(SimCpu::new).collect(),
                halted: AtomicBool::new(false),
                fault: Mutex::new(None),
                sink: OnceLock::new(),
            }),
        }
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.machine.cpus.len()
    }

    /// Run the calling OS thread as CPU `slot`.
    ///
    /// # Panics
    /// If `slot` does not exist.
    pub fn attach(&self, slot: usize) {
        assert!(slot < self.machine.cpus.len(), "no simulated cpu {slot}");
        SLOT.set(Some(slot));
    }

    /// Detach the calling OS thread from its CPU.
    pub fn detach(&self) {
        SLOT.set(None);
    }

    /// Run `f` as CPU `slot`, then restore the previous attachment.
    pub fn with_cpu<R>(&self, slot: usize, f: impl FnOnce() -> R) -> R {
        let previous = SLOT.get();
        self.attach(slot);
        let result = f();
        SLOT.set(previous);
        result
    }

    /// Start an OS thread running as CPU `slot`.
    ///
    /// The handle yields `Ok` when `f` returns or when the thread was stopped
    /// by a machine halt; a genuine panic is re-raised on join.
    pub fn spawn_cpu(&self, slot: usize, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
        let sim = self.clone();
        thread::Builder::new()
            .name(format!("sim-cpu{slot}"))
            .spawn(move || {
                sim.attach(slot);
                let outcome = panic::catch_unwind(AssertUnwindSafe(f));
                sim.detach();
                if let Err(payload) = outcome {
                    if !is_quiet(payload.as_ref()) {
                        sim.machine.halt_with(describe(payload.as_ref()));
                        panic::resume_unwind(payload);
                    }
                }
            })
            .expect("spawn simulated cpu thread")
    }

    /// Queue an external interrupt on CPU `slot`.
    pub fn raise_interrupt(&self, slot: usize, vector: u8) {
        lock(&self.machine.cpus[slot].pending).push_back(vector);
    }

    /// Vectors queued on CPU `slot` and not yet taken.
    #[must_use]
    pub fn pending_interrupts(&self, slot: usize) -> Vec<u8> {
        lock(&self.machine.cpus[slot].pending).iter().copied().collect()
    }

    /// TLB maintenance done by CPU `slot` so far.
    #[must_use]
    pub fn tlb_events(&self, slot: usize) -> Vec<TlbEvent> {
        lock(&self.machine.cpus[slot].tlb).clone()
    }

    /// Interrupts CPU `slot` has acknowledged.
    #[must_use]
    pub fn eoi_count(&self, slot: usize) -> u64 {
        self.machine.cpus[slot].eoi.load(Ordering::Acquire)
    }

    /// Stop all simulated threads. Threads unwind quietly at their next
    /// interaction with the machine.
    pub fn power_off(&self) {
        self.machine.halted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.machine.halted.load(Ordering::Acquire)
    }

    /// The first panic message recorded by a simulated thread, if any.
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        lock(&self.machine.fault).clone()
    }

    fn slot(&self) -> usize {
        SLOT.get()
            .unwrap_or_else(|| panic!("thread is not attached to a simulated cpu"))
    }

    fn cpu(&self) -> &SimCpu {
        &self.machine.cpus[self.slot()]
    }

    fn check_halted(&self) {
        if self.machine.halted.load(Ordering::Acquire) && !thread::panicking() {
            panic::resume_unwind(Box::new(Halted));
        }
    }

    /// Take pending interrupts while the flag allows it.
    fn deliver_pending(&self) -> bool {
        self.check_halted();
        let mut delivered = false;
        loop {
            let cpu = self.cpu();
            if !cpu.interrupts_enabled() {
                break;
            }
            let Some(vector) = lock(&cpu.pending).pop_front() else {
                break;
            };
            cpu.set_interrupts(false);
            if let Some(sink) = self.machine.sink.get() {
                sink.dispatch(vector);
            }
            self.cpu().set_interrupts(true);
            delivered = true;
        }
        delivered
    }
}

impl Arch for Sim {
    type Context = SimContext;

    fn interrupts_enabled(&self) -> bool {
        self.cpu().interrupts_enabled()
    }

    fn disable_interrupts(&self) {
        self.cpu().set_interrupts(false);
    }

    fn enable_interrupts(&self) {
        self.cpu().set_interrupts(true);
        self.deliver_pending();
    }

    fn relax(&self) {
        self.check_halted();
        if self.cpu().interrupts_enabled() {
            self.deliver_pending();
        }
        thread::yield_now();
    }

    fn wait_for_interrupt(&self) {
        if !self.deliver_pending() {
            thread::sleep(IDLE_SLEEP);
        }
    }

    fn local_apic_id(&self) -> u32 {
        self.cpu().apic_id
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        let (destination, shorthand) = match target {
            IpiTarget::Apic(id) => (id, DestinationShorthand::None),
            IpiTarget::AllExcludingSelf => (0, DestinationShorthand::AllExcludingSelf),
            IpiTarget::All => (0, DestinationShorthand::AllIncludingSelf),
        };
        let high = IcrHigh::new().with_destination(destination.try_into().unwrap_or(u8::MAX));
        let low = IcrLow::fixed(vector, shorthand);

        let sender = self.slot();
        for (slot, cpu) in self.machine.cpus.iter().enumerate() {
            let hit = match low.shorthand() {
                DestinationShorthand::None => cpu.apic_id == u32::from(high.destination()),
                DestinationShorthand::SelfOnly => slot == sender,
                DestinationShorthand::AllIncludingSelf => true,
                DestinationShorthand::AllExcludingSelf => slot != sender,
            };
            if hit {
                lock(&cpu.pending).push_back(low.vector());
            }
        }
    }

    fn wait_for_ipi_delivery(&self) {
        // Queued synchronously by `send_ipi`.
        self.check_halted();
    }

    fn end_of_interrupt(&self) {
        self.cpu().eoi.fetch_add(1, Ordering::AcqRel);
    }

    fn active_page_directory(&self) -> PhysicalAddress {
        Cr3::from_bits(self.cpu().cr3.load(Ordering::Acquire)).directory()
    }

    fn load_page_directory(&self, directory: PhysicalAddress) {
        let cpu = self.cpu();
        cpu.cr3
            .store(Cr3::from_directory(directory).into_bits(), Ordering::Release);
        lock(&cpu.tlb).push(TlbEvent::LoadDirectory(directory));
    }

    fn invalidate_page(&self, page: VirtualAddress) {
        lock(&self.cpu().tlb).push(TlbEvent::InvalidatePage(page));
    }

    fn flush_tlb(&self) {
        lock(&self.cpu().tlb).push(TlbEvent::FlushAll);
    }

    fn new_context(&self, entry: Box<dyn FnOnce() + Send>) -> SimContext {
        let baton = Arc::new(Baton::new());
        let theirs = Arc::clone(&baton);
        let sim = self.clone();
        thread::Builder::new()
            .name("sim-context".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let slot = theirs.wait(&sim.machine);
                    SLOT.set(Some(slot));
                    entry();
                }));
                SLOT.set(None);
                if let Err(payload) = outcome {
                    if !is_quiet(payload.as_ref()) {
                        sim.machine.halt_with(describe(payload.as_ref()));
                    }
                }
            })
            .expect("spawn simulated context thread");
        SimContext { baton }
    }

    fn bootstrap_context(&self) -> SimContext {
        SimContext {
            baton: Arc::new(Baton::new()),
        }
    }

    unsafe fn switch_context(&self, from: &SimContext, to: &SimContext) {
        let slot = self.slot();
        SLOT.set(None);
        to.baton.pass(slot);
        let slot = from.baton.wait(&self.machine);
        SLOT.set(Some(slot));
    }

    fn halt(&self, reason: fmt::Arguments<'_>) -> ! {
        if thread::panicking() {
            park_forever();
        }
        if self.machine.halted.swap(true, Ordering::AcqRel) {
            panic::resume_unwind(Box::new(Halted));
        }
        panic!("{reason}");
    }

    fn attach_interrupt_sink(&self, sink: &'static dyn InterruptSink) {
        let _ = self.machine.sink.set(sink);
    }
}
