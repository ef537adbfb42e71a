use crate::cpu::Cpus;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_arch::Arch;

/// One-shot rendezvous of all active CPUs.
///
/// Each CPU calls [`enter`](Self::enter) once; everyone returns after as many
/// CPUs have entered as are active. CPUs that are not yet active are not
/// waited for.
pub struct Checkpoint {
    entered: AtomicUsize,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entered: AtomicUsize::new(0),
        }
    }

    pub fn enter<A: Arch>(&self, cpus: &Cpus<A>) {
        let arrived = self.entered.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("checkpoint: {arrived} arrived");
        while self.entered.load(Ordering::Acquire) < cpus.active_count() {
            cpus.arch().relax();
        }
    }

    /// CPUs that have entered so far.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::Acquire)
    }
}
