//! # Processes and threads
//!
//! A process owns a page directory and a list of threads; a thread owns a
//! saved execution context. Both live in the [`ProcTable`], which the kernel
//! keeps behind a single spinlock.
//!
//! ```text
//! Process:  New ──► Ready ◄──► Running
//!                     └──► Defunct ──► Truncate (removed)
//!
//! Thread:   New ──► Ready ──► Running ──► Blocked | Sleeping ──► Ready …
//!                                   └──► Exited (reaped)
//! ```
//!
//! The kernel process (pid 0) never leaves `Ready`; its threads may run on
//! several CPUs at once.

mod table;

pub use table::ProcTable;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PhysicalAddress;

/// Process id. `0` is the kernel process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// Thread id, unique for the lifetime of the kernel. Never `0`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

pub const KERNEL_PID: Pid = Pid(0);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    /// Every thread has exited; the address space is being torn down.
    Defunct,
    /// Torn down; about to leave the table.
    Truncate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Exited,
    /// A CPU's scheduler loop. Never selected by a scan.
    Scheduler,
}

/// Why a thread could not be added.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("no process with {0}")]
    UnknownProcess(Pid),
    #[error("{0} is shutting down and takes no new threads")]
    NotAccepting(Pid),
    #[error("could not build the address space: {0}")]
    Paging(#[from] kernel_vmem::MapError),
}

/// Identifies what a blocked thread waits for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WaitChannel(u64);

impl WaitChannel {
    /// A channel no other caller has been given.
    #[must_use]
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub name: &'static str,
    pub state: ProcessState,
    /// Physical address of the page directory.
    pub directory: PhysicalAddress,
    /// Owned threads; new threads go to the front.
    pub threads: VecDeque<Tid>,
}

impl Process {
    pub(crate) const fn new(pid: Pid, name: &'static str, directory: PhysicalAddress) -> Self {
        Self {
            pid,
            name,
            state: ProcessState::New,
            directory,
            threads: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.pid == KERNEL_PID
    }
}

pub struct Thread<C> {
    pub tid: Tid,
    pub name: &'static str,
    pub state: ThreadState,
    pub pid: Pid,
    /// `None` for scheduler threads, whose context lives in the CPU
    /// descriptor.
    pub(crate) context: Option<Box<C>>,
    pub channel: Option<WaitChannel>,
    /// Tick at which the thread went to sleep.
    pub slept_at: u64,
    /// Tick at which a sleeping thread becomes ready.
    pub wake_at: u64,
}

impl<C> Thread<C> {
    #[must_use]
    pub fn new(tid: Tid, name: &'static str, context: Option<Box<C>>) -> Self {
        Self {
            tid,
            name,
            state: ThreadState::New,
            pid: KERNEL_PID,
            context,
            channel: None,
            slept_at: 0,
            wake_at: 0,
        }
    }
}

impl<C> fmt::Debug for Thread<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
