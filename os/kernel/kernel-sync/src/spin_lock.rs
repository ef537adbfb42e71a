use crate::cpu::Cpus;
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};
use kernel_arch::Arch;

/// `owner` of a free lock.
const NO_CPU: usize = usize::MAX;
/// `owner` of a lock taken before CPU enumeration.
const UNKNOWN_CPU: usize = usize::MAX - 1;
/// `holder` when no thread runs on the owning CPU.
const NO_THREAD: u64 = 0;

/// Test-and-test-and-set lock owned by a CPU.
///
/// Acquiring disables interrupts and preemption on the acquiring CPU first;
/// releasing reverses both. If interrupts were enabled at the call, they are
/// re-enabled between attempts while spinning, so a waiting CPU still
/// services IPIs.
///
/// Only the holding CPU may release. A guard may be given away to another
/// control flow on the same CPU with [`SpinLockGuard::handoff`] and picked
/// up with [`SpinLock::adopt`].
pub struct SpinLock<T> {
    name: &'static str,
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    owner: AtomicUsize,
    /// Thread running on the owning CPU when the lock was taken or adopted.
    holder: AtomicU64,
    depth: AtomicU32,
    handed_off: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, inner: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_CPU),
            holder: AtomicU64::new(NO_THREAD),
            depth: AtomicU32::new(0),
            handed_off: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current recursion depth; 0 when free.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Id of the thread that holds the lock, if a thread took it.
    #[must_use]
    pub fn holder(&self) -> Option<u64> {
        match self.holder.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    /// Whether the calling CPU holds this lock.
    pub fn held<A: Arch>(&self, cpus: &Cpus<A>) -> bool {
        cpus.push_no_interrupts();
        let held = self.locked.load(Ordering::Acquire)
            && self.owner.load(Ordering::Acquire) == owner_tag(cpus);
        cpus.pop_no_interrupts();
        held
    }

    /// Spin until acquired (TATAS), then return a guard.
    ///
    /// Taking a lock this CPU already holds is fatal; use
    /// [`lock_recursive`](Self::lock_recursive) for re-entrant paths.
    #[track_caller]
    pub fn lock<'a, A: Arch>(&'a self, cpus: &'a Cpus<A>) -> SpinLockGuard<'a, T, A> {
        let interruptible = cpus.arch().interrupts_enabled();
        cpus.push_no_interrupts();
        cpus.preempt_disable();

        let me = owner_tag(cpus);
        if self.locked.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == me {
            crate::fatal!(cpus, "spinlock {} acquired twice by its holder", self.name);
        }
        self.acquire(cpus, me, interruptible);
        SpinLockGuard { lock: self, cpus }
    }

    /// Try once; returns immediately.
    #[inline]
    #[track_caller]
    pub fn try_lock<'a, A: Arch>(&'a self, cpus: &'a Cpus<A>) -> Option<SpinLockGuard<'a, T, A>> {
        cpus.push_no_interrupts();
        cpus.preempt_disable();
        if self.try_acquire() {
            self.owner.store(owner_tag(cpus), Ordering::Release);
            self.holder.store(holder_tag(cpus), Ordering::Release);
            self.depth.store(1, Ordering::Release);
            Some(SpinLockGuard { lock: self, cpus })
        } else {
            cpus.preempt_enable();
            cpus.pop_no_interrupts();
            None
        }
    }

    /// Acquire, or bump the depth if this CPU already holds the lock.
    #[track_caller]
    pub fn lock_recursive<'a, A: Arch>(
        &'a self,
        cpus: &'a Cpus<A>,
    ) -> SpinLockRecursiveGuard<'a, T, A> {
        let interruptible = cpus.arch().interrupts_enabled();
        cpus.push_no_interrupts();
        cpus.preempt_disable();

        let me = owner_tag(cpus);
        if self.locked.load(Ordering::Acquire) && self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::AcqRel);
        } else {
            self.acquire(cpus, me, interruptible);
        }
        SpinLockRecursiveGuard { lock: self, cpus }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    #[track_caller]
    pub fn with_lock<A: Arch, R>(&self, cpus: &Cpus<A>, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock(cpus);
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Take over a guard that a previous control flow on this CPU gave
    /// away with [`SpinLockGuard::handoff`].
    #[track_caller]
    pub fn adopt<'a, A: Arch>(&'a self, cpus: &'a Cpus<A>) -> SpinLockGuard<'a, T, A> {
        let held = self.locked.load(Ordering::Acquire)
            && self.owner.load(Ordering::Acquire) == owner_tag(cpus);
        if !held || !self.handed_off.swap(false, Ordering::AcqRel) {
            crate::fatal!(cpus, "spinlock {} adopted without a handoff", self.name);
        }
        self.holder.store(holder_tag(cpus), Ordering::Release);
        SpinLockGuard { lock: self, cpus }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire<A: Arch>(&self, cpus: &Cpus<A>, me: usize, interruptible: bool) {
        let arch = cpus.arch();
        while !self.try_acquire() {
            // Contended path: spin on a read (cheap), then retry CAS.
            while self.locked.load(Ordering::Relaxed) {
                if interruptible {
                    arch.enable_interrupts();
                    arch.relax();
                    arch.disable_interrupts();
                } else {
                    arch.relax();
                }
            }
        }
        self.owner.store(me, Ordering::Release);
        self.holder.store(holder_tag(cpus), Ordering::Release);
        self.depth.store(1, Ordering::Release);
    }

    #[track_caller]
    fn release<A: Arch>(&self, cpus: &Cpus<A>) {
        if !self.locked.load(Ordering::Acquire)
            || self.owner.load(Ordering::Acquire) != owner_tag(cpus)
        {
            crate::fatal!(
                cpus,
                "spinlock {} released by a cpu that does not hold it (holder thread {:?})",
                self.name,
                self.holder()
            );
        }
        self.depth.store(0, Ordering::Release);
        self.owner.store(NO_CPU, Ordering::Release);
        self.holder.store(NO_THREAD, Ordering::Release);
        self.handed_off.store(false, Ordering::Release);
        // Release publishes the critical section.
        self.locked.store(false, Ordering::Release);
        cpus.preempt_enable();
        cpus.pop_no_interrupts();
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match self.owner.load(Ordering::Relaxed) {
            NO_CPU => None,
            cpu => Some(cpu),
        };
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .field("owner", &owner)
            .field("holder", &self.holder())
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

/// Owner tag of the calling CPU; interrupts must be off.
fn owner_tag<A: Arch>(cpus: &Cpus<A>) -> usize {
    cpus.local().map_or(UNKNOWN_CPU, |cpu| cpu.index())
}

fn holder_tag<A: Arch>(cpus: &Cpus<A>) -> u64 {
    cpus.local()
        .and_then(|cpu| cpu.current_thread())
        .unwrap_or(NO_THREAD)
}

pub struct SpinLockGuard<'a, T, A: Arch> {
    lock: &'a SpinLock<T>,
    cpus: &'a Cpus<A>,
}

impl<'a, T, A: Arch> SpinLockGuard<'a, T, A> {
    /// Give the held lock to the next control flow that runs on this CPU.
    ///
    /// The lock stays held and the CPU keeps its interrupt and preemption
    /// counts; the receiver calls [`SpinLock::adopt`] and releases it
    /// normally.
    pub fn handoff(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        lock.handed_off.store(true, Ordering::Release);
        core::mem::forget(self);
        lock
    }

    pub const fn cpus(&self) -> &'a Cpus<A> {
        self.cpus
    }
}

impl<T, A: Arch> Deref for SpinLockGuard<'_, T, A> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T, A: Arch> DerefMut for SpinLockGuard<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T, A: Arch> Drop for SpinLockGuard<'_, T, A> {
    fn drop(&mut self) {
        self.lock.release(self.cpus);
    }
}

/// Shared guard of a possibly re-entered lock.
pub struct SpinLockRecursiveGuard<'a, T, A: Arch> {
    lock: &'a SpinLock<T>,
    cpus: &'a Cpus<A>,
}

impl<T, A: Arch> Deref for SpinLockRecursiveGuard<'_, T, A> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T, A: Arch> Drop for SpinLockRecursiveGuard<'_, T, A> {
    fn drop(&mut self) {
        if self.lock.depth.load(Ordering::Acquire) > 1 {
            self.lock.depth.fetch_sub(1, Ordering::AcqRel);
            self.cpus.preempt_enable();
            self.cpus.pop_no_interrupts();
        } else {
            self.lock.release(self.cpus);
        }
    }
}
