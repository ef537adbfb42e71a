use crate::process::{ProcTable, Tid, WaitChannel};
use crate::sync::MutexGuard;
use crate::{Kernel, ProcGuard};
use core::mem::ManuallyDrop;
use kernel_arch::Arch;
use kernel_vmem::PhysMapper;

/// A condition threads block on until another thread notifies it.
///
/// There is no stored signal: a notification with no waiter is lost, so
/// waiting is always done under the process lock after re-checking the
/// condition.
#[derive(Debug, Default)]
pub struct Condvar {
    channel: WaitChannel,
}

impl Condvar {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channel: WaitChannel::new(),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> WaitChannel {
        self.channel
    }

    /// Block until notified. The process lock is given up while blocked and
    /// held again on return.
    pub fn wait<'a, A: Arch, M: PhysMapper + Send + Sync + 'static>(
        &self,
        kernel: &'a Kernel<A, M>,
        procs: ProcGuard<'a, A>,
    ) -> ProcGuard<'a, A> {
        kernel.thread_wait(self.channel, procs)
    }

    /// Release `guard`'s mutex, block until notified, then lock it again.
    pub fn wait_on<'a, T, A: Arch, M: PhysMapper + Send + Sync + 'static>(
        &self,
        guard: MutexGuard<'a, T, A, M>,
    ) -> MutexGuard<'a, T, A, M> {
        let guard = ManuallyDrop::new(guard);
        let (mutex, kernel) = (guard.mutex(), guard.kernel());
        let mut procs = kernel.lock_procs();
        // Released under the process lock so no notification is lost between
        // the release and the wait.
        mutex.release(kernel, &mut procs);
        drop(self.wait(kernel, procs));
        mutex.lock(kernel)
    }

    /// Make the first waiter ready.
    pub fn notify_one<C>(&self, procs: &mut ProcTable<C>) -> Option<Tid> {
        procs.notify_one(self.channel)
    }

    /// Make every waiter ready.
    pub fn notify_all<C>(&self, procs: &mut ProcTable<C>) -> usize {
        procs.notify_all(self.channel)
    }
}
