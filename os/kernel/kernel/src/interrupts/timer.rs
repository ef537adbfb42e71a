use crate::Kernel;
use core::sync::atomic::Ordering;
use kernel_arch::Arch;
use kernel_vmem::PhysMapper;

/// Local APIC timer. Only the first CPU advances the tick count, so ticks
/// measure time rather than the number of CPUs. There is no preemption.
pub fn tick<A: Arch, M: PhysMapper + Send + Sync + 'static>(kernel: &Kernel<A, M>, _vector: u8) {
    if kernel.cpus.current().index() == 0 {
        kernel.ticks.fetch_add(1, Ordering::AcqRel);
    }
}
