//! # Kernel Core
//!
//! The multiprocessor core of the kernel: interrupt dispatch, the paging
//! subsystem with cross-CPU TLB shootdown, the process and thread tables,
//! the per-CPU cooperative scheduler and the blocking primitives built on it.
//!
//! Everything hangs off one [`Kernel`] value, created once on the bootstrap
//! processor and then shared (`&'static`) by every CPU:
//!
//! ```text
//!  boot CPU:  Kernel::new ─► register_default_handlers ─► mark_initialized
//!  each CPU:  start_cpu ─► run_scheduler ─┬─► thread ─► yield / wait / sleep / exit
//!                                         └──────────◄──────────┘
//!  interrupt: Arch entry stub ─► Kernel::handle_interrupt ─► handler ─► EOI
//! ```
//!
//! ## Locks
//!
//! | Lock           | Guards                                      |
//! |----------------|---------------------------------------------|
//! | process lock   | the [`ProcTable`]; handed to the next thread on a switch |
//! | kernel PT lock | edits of the kernel page tables             |
//! | IPI lock       | the shared shootdown request                |
//! | frame lock     | the physical free list (inside the allocator) |
//!
//! Paging code refuses to run while the calling CPU holds the frame lock.
//!
//! ## Features
//!
//! * `qemu` (default): log to the QEMU debug port via [`tracing::init_logging`].
//! * `sim`: build against the host machine model for tests.

#![cfg_attr(not(any(test, doctest, feature = "sim")), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod init;
pub mod interrupts;
pub mod process;
mod sched;
pub mod sync;
pub mod tracing;
mod vmem;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_alloc::FreeListFrameAlloc;
use kernel_arch::Arch;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{Checkpoint, Cpus, IrqGuard, SpinLock, SpinLockGuard};
use kernel_vmem::{PhysMapper, VmMap};

pub use init::BootError;
pub use interrupts::{ISR_VECTORS, Isr};
pub use process::{
    KERNEL_PID, Pid, ProcTable, Process, ProcessError, ProcessState, Thread, ThreadState, Tid,
    WaitChannel,
};
pub use sync::{Condvar, Mutex, MutexGuard};

/// The process lock, held.
pub type ProcGuard<'a, A> = SpinLockGuard<'a, ProcTable<<A as Arch>::Context>, A>;

/// Shared state of the kernel core.
pub struct Kernel<A: Arch, M: PhysMapper> {
    cpus: Arc<Cpus<A>>,
    frames: FreeListFrameAlloc<A, M>,
    vm_map: VmMap,
    kernel_pd: PhysicalAddress,
    kpt_lock: SpinLock<()>,
    shootdown: vmem::Shootdown,
    isrs: SpinLock<[Option<Isr<A, M>>; ISR_VECTORS]>,
    initialized: AtomicBool,
    procs: SpinLock<ProcTable<A::Context>>,
    startup: Checkpoint,
    ticks: AtomicU64,
}

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> Kernel<A, M> {
    /// The CPU registry.
    #[must_use]
    pub fn cpus(&self) -> &Cpus<A> {
        &self.cpus
    }

    #[must_use]
    pub fn arch(&self) -> &A {
        self.cpus.arch()
    }

    /// The physical page allocator.
    #[must_use]
    pub const fn frames(&self) -> &FreeListFrameAlloc<A, M> {
        &self.frames
    }

    #[must_use]
    pub const fn vm_map(&self) -> &VmMap {
        &self.vm_map
    }

    /// Take the process lock.
    #[must_use]
    #[track_caller]
    pub fn lock_procs(&self) -> ProcGuard<'_, A> {
        self.procs.lock(&self.cpus)
    }

    /// Timer ticks counted on the first CPU.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Whether the interrupt table is sealed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The thread running on this CPU, `None` inside a scheduler loop.
    #[must_use]
    pub fn current_thread(&self) -> Option<Tid> {
        let _irq = IrqGuard::new(&self.cpus);
        self.cpus.current().current_thread().map(Tid)
    }

    #[must_use]
    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.lock_procs().thread(tid).map(|t| t.state)
    }

    #[must_use]
    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.lock_procs().get(pid).map(|p| p.state)
    }
}
