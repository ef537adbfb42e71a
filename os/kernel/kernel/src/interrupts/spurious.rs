use crate::Kernel;
use kernel_arch::Arch;
use kernel_vmem::PhysMapper;

/// Spurious APIC interrupt: nothing to do, and no EOI.
pub const fn ignore<A: Arch, M: PhysMapper + Send + Sync + 'static>(
    _kernel: &Kernel<A, M>,
    _vector: u8,
) {
}
