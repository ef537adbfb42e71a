use crate::Kernel;
use crate::process::{ProcTable, Tid};
use crate::sync::Condvar;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_arch::Arch;
use kernel_sync::fatal;
use kernel_vmem::PhysMapper;

/// `owner` value while unlocked. Thread ids start at 1.
const NO_OWNER: u64 = 0;

/// A lock whose waiters sleep instead of spinning.
///
/// Only threads may take it. Waiters are woken one per release in process
/// table order, so the mutex is not fair.
pub struct Mutex<T> {
    locked: AtomicBool,
    owner: AtomicU64,
    queue: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            queue: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// The thread holding the mutex.
    #[must_use]
    pub fn owner(&self) -> Option<Tid> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            tid => Some(Tid(tid)),
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquire the mutex, sleeping while another thread holds it.
    #[track_caller]
    pub fn lock<'a, A: Arch, M: PhysMapper + Send + Sync + 'static>(
        &'a self,
        kernel: &'a Kernel<A, M>,
    ) -> MutexGuard<'a, T, A, M> {
        if kernel.in_interrupt() {
            fatal!(kernel.cpus(), "mutex acquired in interrupt context");
        }
        loop {
            if let Some(guard) = self.try_lock(kernel) {
                return guard;
            }
            let procs = kernel.lock_procs();
            // The holder releases under the process lock, so it cannot slip
            // in between this check and the wait.
            if self.is_locked() {
                drop(self.queue.wait(kernel, procs));
            }
        }
    }

    /// Acquire the mutex if it is free.
    #[track_caller]
    pub fn try_lock<'a, A: Arch, M: PhysMapper + Send + Sync + 'static>(
        &'a self,
        kernel: &'a Kernel<A, M>,
    ) -> Option<MutexGuard<'a, T, A, M>> {
        let Some(me) = kernel.current_thread() else {
            fatal!(kernel.cpus(), "mutex acquired outside of a thread");
        };
        if self.owner() == Some(me) {
            fatal!(kernel.cpus(), "mutex locked again by its owner {me}");
        }
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.owner.store(me.0, Ordering::Release);
        Some(MutexGuard {
            mutex: self,
            kernel,
            _not_send: PhantomData,
        })
    }

    /// Give the mutex up and wake one waiter. The caller holds the process
    /// lock.
    #[track_caller]
    pub(crate) fn release<A: Arch, M: PhysMapper + Send + Sync + 'static, C>(
        &self,
        kernel: &Kernel<A, M>,
        procs: &mut ProcTable<C>,
    ) {
        let me = kernel.current_thread();
        let owner = self.owner();
        if owner.is_none() || owner != me {
            fatal!(
                kernel.cpus(),
                "mutex released by {me:?} but held by {owner:?}"
            );
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        self.queue.notify_one(procs);
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Holds a [`Mutex`] until dropped.
pub struct MutexGuard<'a, T, A: Arch, M: PhysMapper + Send + Sync + 'static> {
    mutex: &'a Mutex<T>,
    kernel: &'a Kernel<A, M>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T, A: Arch, M: PhysMapper + Send + Sync + 'static> MutexGuard<'a, T, A, M> {
    pub(crate) const fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    pub(crate) const fn kernel(&self) -> &'a Kernel<A, M> {
        self.kernel
    }
}

impl<T, A: Arch, M: PhysMapper + Send + Sync + 'static> Deref for MutexGuard<'_, T, A, M> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, A: Arch, M: PhysMapper + Send + Sync + 'static> DerefMut for MutexGuard<'_, T, A, M> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, A: Arch, M: PhysMapper + Send + Sync + 'static> Drop for MutexGuard<'_, T, A, M> {
    fn drop(&mut self) {
        self.mutex.release(self.kernel, &mut self.kernel.lock_procs());
    }
}
