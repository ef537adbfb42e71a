//! # Scheduler
//!
//! One scheduler loop per CPU, cooperative threads, no ready queue. Each
//! loop pass takes the process lock, wakes expired sleepers and scans the
//! [`ProcTable`](crate::ProcTable) for the first ready thread. If it finds
//! one it switches to it *without releasing the process lock*:
//!
//! ```text
//!  scheduler                          thread
//!  ─────────                          ──────
//!  lock procs
//!  pick T, mark running
//!  handoff ── switch_context ──────►  adopt procs, unlock, run …
//!                                     lock procs, mark ready/blocked/…
//!  adopt procs ◄─── switch_context ── handoff
//!  reap T if it exited
//!  unlock
//! ```
//!
//! The lock therefore always changes hands together with the CPU. A guard
//! is given away with `SpinLockGuard::handoff` and taken over on the other
//! side with `SpinLock::adopt`; a first-time thread adopts it in its entry
//! trampoline.

use crate::process::{KERNEL_PID, Pid, ProcessError, Thread, ThreadState, Tid, WaitChannel};
use crate::{Kernel, ProcGuard};
use alloc::boxed::Box;
use kernel_arch::Arch;
use kernel_sync::{IrqGuard, fatal};
use kernel_vmem::PhysMapper;

impl<A: Arch, M: PhysMapper + Send + Sync + 'static> Kernel<A, M> {
    /// Run this CPU's scheduler loop. The CPU must have been started with
    /// [`start_cpu`](Self::start_cpu).
    pub fn run_scheduler(&self) -> ! {
        let arch = self.arch();
        let cpu = {
            let _irq = IrqGuard::new(&self.cpus);
            self.cpus.current()
        };
        if !cpu.is_active() {
            fatal!(self.cpus, "scheduler started on inactive cpu{}", cpu.index());
        }

        let tid = self.lock_procs().insert_scheduler_thread("scheduler");
        cpu.set_scheduler_thread(tid.0);
        let scheduler = cpu.scheduler_context(|| arch.bootstrap_context());
        log::info!("cpu{} scheduling as {tid}", cpu.index());

        loop {
            arch.enable_interrupts();
            let mut procs = self.lock_procs();
            procs.wake_sleepers(self.ticks());
            let Some(next) = procs.first_ready_thread() else {
                drop(procs);
                arch.wait_for_interrupt();
                continue;
            };
            let Some((directory, context)) = procs.dispatch(next) else {
                fatal!(self.cpus, "{next} is ready but has no context");
            };

            cpu.set_current_thread(Some(next.0));
            arch.load_page_directory(directory);
            let lock = procs.handoff();
            // SAFETY: interrupts are off while the lock is held, and a running
            // thread is never reaped, so its context outlives the switch.
            unsafe { arch.switch_context(scheduler, context.as_ref()) };
            let mut procs = lock.adopt(&self.cpus);

            arch.load_page_directory(self.kernel_pd);
            cpu.set_current_thread(None);
            let retired = procs.reap(next);
            drop(procs);

            if let Some((pid, directory)) = retired {
                self.destroy_directory(directory);
                self.lock_procs().truncate(pid);
            }
        }
    }

    /// Give the CPU back to its scheduler loop.
    ///
    /// The caller holds the process lock exactly once, with interrupts off,
    /// and has already moved the current thread out of `Running`. The lock
    /// travels with the switch and comes back when the thread is resumed,
    /// possibly on another CPU.
    #[track_caller]
    fn reschedule<'a>(&'a self, mut procs: ProcGuard<'a, A>) -> ProcGuard<'a, A> {
        if self.arch().interrupts_enabled() {
            fatal!(self.cpus, "reschedule with interrupts enabled");
        }
        let cpu = self.cpus.current();
        if cpu.irq_depth() != 1 {
            fatal!(
                self.cpus,
                "reschedule with {} interrupt-disable levels held",
                cpu.irq_depth()
            );
        }
        let tid = self.running();
        let Some(thread) = procs.thread(tid) else {
            fatal!(self.cpus, "running {tid} is not in the process table");
        };
        if thread.state == ThreadState::Running {
            fatal!(self.cpus, "reschedule of {tid} while it is still running");
        }
        let pid = thread.pid;
        procs.demote(pid);
        let Some(from) = procs.context(tid) else {
            fatal!(self.cpus, "{tid} has no saved context");
        };

        let scheduler = cpu.scheduler_context(|| self.arch().bootstrap_context());
        let interrupts_were_enabled = cpu.interrupts_were_enabled();
        let lock = procs.handoff();
        // SAFETY: interrupts are off; the thread's context stays in the table
        // until its scheduler reaps it after this switch.
        unsafe { self.arch().switch_context(from.as_ref(), scheduler) };
        let procs = lock.adopt(&self.cpus);
        self.cpus
            .current()
            .set_interrupts_were_enabled(interrupts_were_enabled);
        procs
    }

    /// The thread on this CPU. Interrupts must be off.
    #[track_caller]
    fn running(&self) -> Tid {
        let cpu = self.cpus.current();
        match cpu.current_thread() {
            Some(tid) => Tid(tid),
            None => fatal!(self.cpus, "no thread is running on cpu{}", cpu.index()),
        }
    }

    /// First code of every thread: take over the process lock from the
    /// scheduler that switched here and release it.
    fn thread_start(&self) {
        drop(self.procs.adopt(&self.cpus));
        if !self.arch().interrupts_enabled() {
            fatal!(self.cpus, "thread started with interrupts disabled");
        }
    }

    fn thread_main(&self, entry: impl FnOnce()) {
        self.thread_start();
        entry();
        self.thread_exit()
    }

    /// A new process with a fresh address space. It becomes ready with its
    /// first thread.
    ///
    /// # Errors
    /// If no frame is left for the page directory.
    pub fn create_process(&self, name: &'static str) -> Result<Pid, ProcessError> {
        let directory = self.create_directory()?;
        let pid = self.lock_procs().insert_process(name, directory);
        log::debug!("created {pid} ({name})");
        Ok(pid)
    }

    /// Start a thread in process `pid` that runs `entry`, then exits.
    ///
    /// # Errors
    /// If the process does not exist or is shutting down.
    pub fn spawn_thread<F>(
        &'static self,
        pid: Pid,
        name: &'static str,
        entry: F,
    ) -> Result<Tid, ProcessError>
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self
            .arch()
            .new_context(Box::new(move || self.thread_main(entry)));
        let mut procs = self.lock_procs();
        let tid = procs.next_tid();
        let tid = procs.add_thread(pid, Thread::new(tid, name, Some(Box::new(context))))?;
        log::debug!("spawned {tid} ({name}) in {pid}");
        Ok(tid)
    }

    /// Start a thread in the kernel process.
    ///
    /// # Errors
    /// Never in practice; the kernel process always accepts threads.
    pub fn spawn_kernel_thread<F>(&'static self, name: &'static str, entry: F) -> Result<Tid, ProcessError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_thread(KERNEL_PID, name, entry)
    }

    /// Let other ready threads run.
    pub fn thread_yield(&self) {
        let mut procs = self.lock_procs();
        let tid = self.running();
        if let Some(thread) = procs.thread_mut(tid) {
            thread.state = ThreadState::Ready;
        }
        drop(self.reschedule(procs));
    }

    /// End the current thread. The scheduler reaps it.
    pub fn thread_exit(&self) -> ! {
        let mut procs = self.lock_procs();
        let tid = self.running();
        if let Some(thread) = procs.thread_mut(tid) {
            thread.state = ThreadState::Exited;
        }
        log::debug!("{tid} exited");
        let _procs = self.reschedule(procs);
        fatal!(self.cpus, "{tid} was resumed after exiting")
    }

    /// Sleep for at least `ticks` timer ticks.
    pub fn thread_sleep(&self, ticks: u64) {
        let mut procs = self.lock_procs();
        let tid = self.running();
        let now = self.ticks();
        if let Some(thread) = procs.thread_mut(tid) {
            thread.state = ThreadState::Sleeping;
            thread.slept_at = now;
            thread.wake_at = now.saturating_add(ticks);
        }
        drop(self.reschedule(procs));
    }

    /// Block the current thread on `channel` until notified. The caller
    /// holds the process lock; it is held again on return.
    pub fn thread_wait<'a>(
        &'a self,
        channel: WaitChannel,
        mut procs: ProcGuard<'a, A>,
    ) -> ProcGuard<'a, A> {
        let tid = self.running();
        procs.block(tid, channel);
        self.reschedule(procs)
    }

    /// Make the first thread waiting on `channel` ready.
    pub fn thread_notify_one(&self, channel: WaitChannel) -> Option<Tid> {
        self.lock_procs().notify_one(channel)
    }

    /// Make every thread waiting on `channel` ready.
    pub fn thread_notify_all(&self, channel: WaitChannel) -> usize {
        self.lock_procs().notify_all(channel)
    }
}
